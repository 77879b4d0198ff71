use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use harmoniq_effect_hal::{
    CommandCode, EffectBuffer, EffectDescriptor, EffectProcessor, EffectResult, EffectSession,
    GainProcessor, HalError, LocalEffect, ProcessBlock, SessionOptions, SharedEffectSession,
    StatusQueue, WaitPolicy,
};

const FRAMES: u32 = 256;
const CHANNELS: u32 = 2;

fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| i as f32 / len as f32).collect()
}

#[test]
fn gain_is_applied_across_many_cycles() {
    let mut session = EffectSession::new(LocalEffect::new(GainProcessor::new(0.5)));
    let input = Arc::new(EffectBuffer::create(CHANNELS, FRAMES).expect("input"));
    let output = Arc::new(EffectBuffer::create(CHANNELS, FRAMES).expect("output"));
    session.set_in_buffer(Some(Arc::clone(&input))).unwrap();
    session.set_out_buffer(Some(Arc::clone(&output))).unwrap();

    let block = ramp((FRAMES * CHANNELS) as usize);
    let mut rendered = vec![0.0f32; block.len()];
    for cycle in 0..32 {
        let scaled: Vec<f32> = block.iter().map(|s| s + cycle as f32).collect();
        input.write_interleaved(&scaled).unwrap();
        session.process().expect("process");
        output.read_interleaved(&mut rendered).unwrap();
        for (out, src) in rendered.iter().zip(&scaled) {
            assert!((out - src * 0.5).abs() < 1e-6, "cycle {cycle}: {out} vs {src}");
        }
    }

    let stats = session.stats();
    assert_eq!(stats.cycles, 32);
    assert_eq!(stats.buffer_pushes, 1);
}

#[test]
fn in_place_processing_uses_one_region() {
    let mut session = EffectSession::new(LocalEffect::new(GainProcessor::new(3.0)));
    let buffer = Arc::new(EffectBuffer::create(CHANNELS, FRAMES).unwrap());
    session.set_in_buffer(Some(Arc::clone(&buffer))).unwrap();
    session.set_out_buffer(Some(Arc::clone(&buffer))).unwrap();

    let block = ramp((FRAMES * CHANNELS) as usize);
    buffer.write_interleaved(&block).unwrap();
    session.process().unwrap();

    let mut rendered = vec![0.0f32; block.len()];
    buffer.read_interleaved(&mut rendered).unwrap();
    for (out, src) in rendered.iter().zip(&block) {
        assert!((out - src * 3.0).abs() < 1e-6);
    }
}

#[test]
fn reverse_path_passes_audio_through() {
    let mut session = EffectSession::new(LocalEffect::new(GainProcessor::new(4.0)));
    let input = Arc::new(EffectBuffer::create(CHANNELS, FRAMES).unwrap());
    let output = Arc::new(EffectBuffer::create(CHANNELS, FRAMES).unwrap());
    session.set_in_buffer(Some(Arc::clone(&input))).unwrap();
    session.set_out_buffer(Some(Arc::clone(&output))).unwrap();

    let block = ramp((FRAMES * CHANNELS) as usize);
    input.write_interleaved(&block).unwrap();
    session.process_reverse().unwrap();

    let mut rendered = vec![0.0f32; block.len()];
    output.read_interleaved(&mut rendered).unwrap();
    assert_eq!(rendered, block);
}

#[test]
fn shrinking_the_block_only_touches_the_active_frames() {
    let mut session = EffectSession::new(LocalEffect::new(GainProcessor::new(2.0)));
    let input = Arc::new(EffectBuffer::create(CHANNELS, FRAMES).unwrap());
    let output = Arc::new(EffectBuffer::create(CHANNELS, FRAMES).unwrap());
    session.set_in_buffer(Some(Arc::clone(&input))).unwrap();
    session.set_out_buffer(Some(Arc::clone(&output))).unwrap();

    output
        .write_interleaved(&vec![-1.0; (FRAMES * CHANNELS) as usize])
        .unwrap();
    input
        .write_interleaved(&vec![1.0; (FRAMES * CHANNELS) as usize])
        .unwrap();
    input.set_frame_count(64).unwrap();
    output.set_frame_count(64).unwrap();
    session.process().unwrap();

    let mut rendered = vec![0.0f32; (FRAMES * CHANNELS) as usize];
    output.read_interleaved(&mut rendered).unwrap();
    let active = (64 * CHANNELS) as usize;
    assert!(rendered[..active].iter().all(|s| *s == 2.0));
    assert!(rendered[active..].iter().all(|s| *s == -1.0));
}

#[test]
fn commands_reach_the_processor() {
    let mut session = EffectSession::new(LocalEffect::new(GainProcessor::new(1.0)));
    session
        .command(CommandCode::SET_PARAM, Some(&0.25f32.to_ne_bytes()), None)
        .unwrap();

    let mut reply = [0u8; 4];
    assert_eq!(session.command(CommandCode::GET_PARAM, None, Some(&mut reply)), Ok(4));
    assert_eq!(f32::from_ne_bytes(reply), 0.25);

    assert_eq!(
        session.command(CommandCode::SET_VOLUME, None, None),
        Err(HalError::InvalidOperation)
    );
}

#[test]
fn shared_session_serialises_cycles_from_several_threads() {
    let session = EffectSession::new(LocalEffect::new(GainProcessor::new(1.0)));
    let shared = SharedEffectSession::new(session);
    {
        let mut guard = shared.lock();
        guard
            .set_in_buffer(Some(Arc::new(EffectBuffer::create(1, 128).unwrap())))
            .unwrap();
        guard
            .set_out_buffer(Some(Arc::new(EffectBuffer::create(1, 128).unwrap())))
            .unwrap();
    }

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let shared = shared.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    shared.process().expect("process");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(shared.lock().stats().cycles, 100);
}

/// Gain that stalls each block while `slow` is set.
struct SlowGain {
    inner: GainProcessor,
    slow: Arc<AtomicBool>,
}

impl EffectProcessor for SlowGain {
    fn descriptor(&self) -> EffectDescriptor {
        self.inner.descriptor()
    }

    fn process(&mut self, block: &mut ProcessBlock<'_>) -> EffectResult {
        if self.slow.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(200));
        }
        self.inner.process(block)
    }
}

// Bit outside the protocol's request and completion bits.
const NOISE: u32 = 1 << 8;

#[test]
fn abandoned_cycle_is_drained_before_the_next_block() {
    let slow = Arc::new(AtomicBool::new(false));
    let mut effect = LocalEffect::new(SlowGain {
        inner: GainProcessor::new(2.0),
        slow: Arc::clone(&slow),
    });
    assert!(!effect.server().is_closed());
    let (result, queue) = effect.server_mut().prepare_for_processing();
    assert_eq!(result, EffectResult::Ok);
    let queue = StatusQueue::open(&queue.expect("status queue")).expect("map status queue");
    let flag = queue.event_flag().expect("event flag");

    let options = SessionOptions::default()
        .with_effect_id(7)
        .with_wait_policy(WaitPolicy::bounded(2));
    let mut session = EffectSession::with_options(effect, options);
    assert_eq!(session.effect_id(), 7);
    let input = Arc::new(EffectBuffer::create(CHANNELS, FRAMES).unwrap());
    let output = Arc::new(EffectBuffer::create(CHANNELS, FRAMES).unwrap());
    session.set_in_buffer(Some(Arc::clone(&input))).unwrap();
    session.set_out_buffer(Some(Arc::clone(&output))).unwrap();
    let len = (FRAMES * CHANNELS) as usize;

    input.write_interleaved(&vec![0.5; len]).unwrap();
    session.process().expect("warm-up cycle");

    input.write_interleaved(&vec![1.0; len]).unwrap();
    slow.store(true, Ordering::SeqCst);
    let quiet = Arc::new(AtomicBool::new(false));
    let noise = {
        let quiet = Arc::clone(&quiet);
        thread::spawn(move || {
            while !quiet.load(Ordering::SeqCst) {
                flag.wake(NOISE).expect("wake");
                thread::sleep(Duration::from_millis(1));
                let _ = flag.wait(NOISE, Some(Duration::from_millis(1)));
            }
        })
    };
    assert_eq!(session.process(), Err(HalError::WouldBlock));
    quiet.store(true, Ordering::SeqCst);
    noise.join().expect("noise thread panicked");

    slow.store(false, Ordering::SeqCst);
    input.write_interleaved(&vec![5.0; len]).unwrap();
    assert_eq!(session.process(), Ok(()));

    let mut rendered = vec![0.0f32; len];
    output.read_interleaved(&mut rendered).unwrap();
    assert!(rendered.iter().all(|s| *s == 10.0));

    let stats = session.stats();
    assert_eq!(stats.status_reads, 3);
    assert_eq!(stats.cycles, 2);
    assert!(stats.transient_wakeups >= 3);
}
