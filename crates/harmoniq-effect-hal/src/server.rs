//! Server half of the processing protocol.
//!
//! [`EffectServer`] owns an [`EffectProcessor`] and answers the calls a
//! client session makes. Processing requests never go through those calls:
//! a worker thread sleeps on the event flag, runs the processor directly on
//! the shared buffers and reports one status per cycle.

use std::io::Write;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::buffer::{EffectBuffer, EffectBufferDescriptor};
use crate::command::{CommandCode, ConfigDirection};
use crate::config::EffectConfig;
use crate::descriptor::{EffectDescriptor, EffectFlags};
use crate::error::{EffectResult, HalError};
use crate::event_flag::{flags, EventFlag};
use crate::remote::{RemoteEffect, TransportError};
use crate::status_queue::{StatusQueue, StatusQueueDescriptor};

/// One block of interleaved audio handed to a processor.
pub struct ProcessBlock<'a> {
    pub input: &'a [f32],
    pub output: &'a mut [f32],
    pub frames: usize,
    pub channels: usize,
}

/// Effect implementation hosted by an [`EffectServer`].
pub trait EffectProcessor: Send {
    fn descriptor(&self) -> EffectDescriptor;

    fn process(&mut self, block: &mut ProcessBlock<'_>) -> EffectResult;

    fn process_reverse(&mut self, _block: &mut ProcessBlock<'_>) -> EffectResult {
        EffectResult::NotSupported
    }

    fn configure(&mut self, _direction: ConfigDirection, _config: &EffectConfig) -> EffectResult {
        EffectResult::Ok
    }

    /// Handles an opaque legacy command, returning a status and reply bytes.
    fn command(&mut self, _code: CommandCode, _data: &[u8], _reply_capacity: u32) -> (i32, Vec<u8>) {
        (HalError::InvalidOperation.code(), Vec::new())
    }
}

struct BoundBuffers {
    input: EffectBuffer,
    output: EffectBuffer,
}

struct Shared {
    processor: Mutex<Box<dyn EffectProcessor>>,
    buffers: Mutex<Option<BoundBuffers>>,
    cycles: AtomicU64,
}

impl Shared {
    fn process(&self, bits: u32, scratch: &mut Vec<f32>) -> EffectResult {
        let buffers = self.buffers.lock();
        let Some(bound) = buffers.as_ref() else {
            return EffectResult::NotInitialized;
        };
        let frames = bound.input.frame_count().min(bound.output.frame_count()) as usize;
        let channels = bound.input.channels() as usize;
        let len = frames * channels;

        // Copy the input out first so in-place processing (same region bound
        // on both sides) never aliases a mutable slice.
        scratch.clear();
        scratch.extend_from_slice(unsafe { bound.input.samples(len) });
        let output = unsafe { bound.output.samples_mut(len) };
        let mut block = ProcessBlock {
            input: scratch.as_slice(),
            output,
            frames,
            channels,
        };

        let mut processor = self.processor.lock();
        let result = if bits & flags::REQUEST_PROCESS != 0 {
            processor.process(&mut block)
        } else {
            processor.process_reverse(&mut block)
        };
        self.cycles.fetch_add(1, Ordering::Relaxed);
        result
    }
}

struct ProcessingWorker {
    queue: StatusQueue,
    event_flag: EventFlag,
    handle: Option<JoinHandle<()>>,
}

impl ProcessingWorker {
    fn spawn(shared: Arc<Shared>) -> Result<Self> {
        let queue = StatusQueue::create()?;
        let event_flag = queue
            .event_flag()
            .ok_or_else(|| anyhow!("status queue has no event flag word"))?;

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let worker_queue = queue.clone();
        let worker_flag = event_flag.clone();
        let handle = thread::Builder::new()
            .name("harmoniq-effect-worker".into())
            .spawn(move || {
                let _ = ready_tx.send(());
                run_worker(&shared, &worker_queue, &worker_flag);
            })
            .context("failed to spawn effect processing worker")?;
        ready_rx
            .recv_timeout(Duration::from_secs(2))
            .context("effect processing worker did not start")?;

        Ok(Self {
            queue,
            event_flag,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.event_flag.wake(flags::REQUEST_QUIT) {
                error!(%err, "failed to ask processing worker to quit");
                return;
            }
            if handle.join().is_err() {
                error!("effect processing worker panicked");
            }
        }
    }
}

impl Drop for ProcessingWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: &Shared, queue: &StatusQueue, event_flag: &EventFlag) {
    let mut scratch = Vec::new();
    loop {
        let bits = match event_flag.wait(flags::REQUEST_PROCESS_ALL, None) {
            Ok(bits) => bits,
            Err(err) if err.is_transient() => continue,
            Err(err) => {
                error!(%err, "effect processing worker wait failed");
                return;
            }
        };
        if bits & flags::REQUEST_QUIT != 0 {
            debug!("effect processing worker exiting");
            return;
        }

        fence(Ordering::Acquire);
        let result = shared.process(bits, &mut scratch);
        fence(Ordering::Release);

        if !queue.write(result) {
            warn!(?result, "status queue full, dropping processing status");
        }
        if let Err(err) = event_flag.wake(flags::DONE_PROCESSING) {
            error!(%err, "failed to signal processing completion");
        }
    }
}

/// Hosts one effect instance and its processing worker.
pub struct EffectServer {
    shared: Arc<Shared>,
    worker: Option<ProcessingWorker>,
    forward_config: EffectConfig,
    reverse_config: EffectConfig,
    closed: bool,
}

impl std::fmt::Debug for EffectServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectServer")
            .field("processing", &self.worker.is_some())
            .field("cycles", &self.cycles())
            .field("closed", &self.closed)
            .finish()
    }
}

impl EffectServer {
    pub fn new(processor: impl EffectProcessor + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                processor: Mutex::new(Box::new(processor)),
                buffers: Mutex::new(None),
                cycles: AtomicU64::new(0),
            }),
            worker: None,
            forward_config: EffectConfig::default(),
            reverse_config: EffectConfig::default(),
            closed: false,
        }
    }

    /// Completed processing cycles.
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn prepare_for_processing(&mut self) -> (EffectResult, Option<StatusQueueDescriptor>) {
        if self.closed {
            return (EffectResult::InvalidState, None);
        }
        if let Some(worker) = &self.worker {
            return (EffectResult::Ok, Some(worker.queue.descriptor()));
        }
        match ProcessingWorker::spawn(Arc::clone(&self.shared)) {
            Ok(worker) => {
                let descriptor = worker.queue.descriptor();
                self.worker = Some(worker);
                (EffectResult::Ok, Some(descriptor))
            }
            Err(err) => {
                error!(?err, "failed to set up effect processing");
                (EffectResult::NotInitialized, None)
            }
        }
    }

    pub fn set_process_buffers(
        &mut self,
        input: &EffectBufferDescriptor,
        output: &EffectBufferDescriptor,
    ) -> EffectResult {
        if input.channels != output.channels {
            warn!(
                input = input.channels,
                output = output.channels,
                "input and output channel counts differ"
            );
            return EffectResult::InvalidArguments;
        }
        let mapped = EffectBuffer::open(input).and_then(|input| {
            let output = EffectBuffer::open(output)?;
            Ok(BoundBuffers { input, output })
        });
        match mapped {
            Ok(bound) => {
                *self.shared.buffers.lock() = Some(bound);
                EffectResult::Ok
            }
            Err(err) => {
                warn!(?err, "failed to map process buffers");
                EffectResult::InvalidArguments
            }
        }
    }

    pub fn get_descriptor(&self) -> EffectDescriptor {
        self.shared.processor.lock().descriptor()
    }

    pub fn command(&mut self, code: CommandCode, data: &[u8], reply_capacity: u32) -> (i32, Vec<u8>) {
        self.shared.processor.lock().command(code, data, reply_capacity)
    }

    pub fn get_config(&self, direction: ConfigDirection) -> EffectConfig {
        match direction {
            ConfigDirection::Forward => self.forward_config,
            ConfigDirection::Reverse => self.reverse_config,
        }
    }

    pub fn set_config(&mut self, direction: ConfigDirection, config: &EffectConfig) -> EffectResult {
        let result = self.shared.processor.lock().configure(direction, config);
        if result.is_ok() {
            match direction {
                ConfigDirection::Forward => self.forward_config = *config,
                ConfigDirection::Reverse => self.reverse_config = *config,
            }
        }
        result
    }

    pub fn close(&mut self) -> EffectResult {
        if self.closed {
            return EffectResult::InvalidState;
        }
        self.closed = true;
        self.worker = None;
        *self.shared.buffers.lock() = None;
        EffectResult::Ok
    }

    pub fn debug(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let descriptor = self.get_descriptor();
        writeln!(out, "effect: {} ({})", descriptor.name, descriptor.implementor)?;
        writeln!(out, "  flags: {:#x}", descriptor.flags.bits())?;
        writeln!(out, "  closed: {}", self.closed)?;
        writeln!(out, "  processing: {}", self.worker.is_some())?;
        writeln!(out, "  cycles: {}", self.cycles())?;
        writeln!(
            out,
            "  channels: in {} out {}",
            self.forward_config.input.channel_mask.channel_count(),
            self.forward_config.output.channel_mask.channel_count()
        )?;
        writeln!(out, "  forward config: {:?}", self.forward_config)?;
        writeln!(out, "  reverse config: {:?}", self.reverse_config)?;
        Ok(())
    }
}

/// [`RemoteEffect`] served by an [`EffectServer`] in the same process.
///
/// Calls are direct, but processing still crosses the shared buffers and the
/// event flag exactly like an out-of-process effect.
#[derive(Debug)]
pub struct LocalEffect {
    server: EffectServer,
}

impl LocalEffect {
    pub fn new(processor: impl EffectProcessor + 'static) -> Self {
        Self {
            server: EffectServer::new(processor),
        }
    }

    pub fn server(&self) -> &EffectServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut EffectServer {
        &mut self.server
    }
}

impl RemoteEffect for LocalEffect {
    fn prepare_for_processing(
        &mut self,
    ) -> Result<(EffectResult, Option<StatusQueueDescriptor>), TransportError> {
        Ok(self.server.prepare_for_processing())
    }

    fn set_process_buffers(
        &mut self,
        input: &EffectBufferDescriptor,
        output: &EffectBufferDescriptor,
    ) -> Result<EffectResult, TransportError> {
        Ok(self.server.set_process_buffers(input, output))
    }

    fn get_descriptor(&mut self) -> Result<(EffectResult, Option<EffectDescriptor>), TransportError> {
        Ok((EffectResult::Ok, Some(self.server.get_descriptor())))
    }

    fn command(
        &mut self,
        code: CommandCode,
        data: &[u8],
        reply_capacity: u32,
    ) -> Result<(i32, Vec<u8>), TransportError> {
        Ok(self.server.command(code, data, reply_capacity))
    }

    fn get_config(
        &mut self,
        direction: ConfigDirection,
    ) -> Result<(EffectResult, Option<EffectConfig>), TransportError> {
        Ok((EffectResult::Ok, Some(self.server.get_config(direction))))
    }

    fn set_config(
        &mut self,
        direction: ConfigDirection,
        config: &EffectConfig,
    ) -> Result<EffectResult, TransportError> {
        Ok(self.server.set_config(direction, config))
    }

    fn close(&mut self) -> Result<EffectResult, TransportError> {
        Ok(self.server.close())
    }

    fn debug(&mut self, out: &mut dyn Write) -> Result<(), TransportError> {
        self.server.debug(out)?;
        Ok(())
    }

    fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Scales the input by a gain; the reverse path passes audio through.
///
/// `SET_PARAM` takes a native-endian `f32` gain, `GET_PARAM` replies with the
/// gain followed by the enabled flag as `u32`.
#[derive(Debug, Clone)]
pub struct GainProcessor {
    uuid: Uuid,
    name: String,
    gain: f32,
    enabled: bool,
    flags: EffectFlags,
}

impl GainProcessor {
    pub fn new(gain: f32) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: "Harmoniq Gain".to_string(),
            gain,
            enabled: true,
            flags: EffectFlags(EffectFlags::TYPE_INSERT),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_flags(mut self, flags: EffectFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl EffectProcessor for GainProcessor {
    fn descriptor(&self) -> EffectDescriptor {
        EffectDescriptor {
            uuid: self.uuid,
            ..EffectDescriptor::new(self.name.clone(), self.flags)
        }
    }

    fn process(&mut self, block: &mut ProcessBlock<'_>) -> EffectResult {
        let gain = if self.enabled { self.gain } else { 1.0 };
        for (dst, src) in block.output.iter_mut().zip(block.input) {
            *dst = *src * gain;
        }
        EffectResult::Ok
    }

    fn process_reverse(&mut self, block: &mut ProcessBlock<'_>) -> EffectResult {
        let len = block.output.len().min(block.input.len());
        block.output[..len].copy_from_slice(&block.input[..len]);
        EffectResult::Ok
    }

    fn command(&mut self, code: CommandCode, data: &[u8], _reply_capacity: u32) -> (i32, Vec<u8>) {
        match code {
            CommandCode::INIT | CommandCode::RESET => (0, Vec::new()),
            CommandCode::ENABLE => {
                self.enabled = true;
                (0, Vec::new())
            }
            CommandCode::DISABLE => {
                self.enabled = false;
                (0, Vec::new())
            }
            CommandCode::SET_PARAM => match <[u8; 4]>::try_from(data) {
                Ok(raw) => {
                    self.gain = f32::from_ne_bytes(raw);
                    (0, Vec::new())
                }
                Err(_) => (HalError::BadValue.code(), Vec::new()),
            },
            CommandCode::GET_PARAM => {
                let mut reply = self.gain.to_ne_bytes().to_vec();
                reply.extend_from_slice(&u32::from(self.enabled).to_ne_bytes());
                (0, reply)
            }
            _ => (HalError::InvalidOperation.code(), Vec::new()),
        }
    }
}
