//! Client-side session driving one remote effect instance.
//!
//! Processing is strictly synchronous: [`EffectSession::process`] publishes the
//! input buffer, raises a request bit and blocks until the server raises the
//! completion bit. Every operation takes `&mut self`, so a single owner can
//! never have two cycles in flight; [`SharedEffectSession`] adds a mutex for
//! callers that share a session between threads.

use std::io::Write;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::binding::BufferBindingTracker;
use crate::buffer::EffectBuffer;
use crate::command::{CommandCode, CommandRoute, ConfigDirection};
use crate::config::{
    effect_config_from_legacy, effect_config_to_legacy, LegacyEffectConfig, LEGACY_CONFIG_SIZE,
};
use crate::descriptor::EffectDescriptor;
use crate::error::{analyze_result, status_code, EffectResult, HalError, Status};
use crate::event_flag::{flags, EventFlag};
use crate::remote::{RemoteEffect, TransportError};
use crate::status_queue::StatusQueue;

/// Bounds the in-place retries of the completion wait.
///
/// A wake-up without the completion bit (signal delivery, futex word changing
/// under the waiter) normally happens at most once per cycle. The bound keeps a
/// storm of such wake-ups from spinning the audio thread forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub max_transient_retries: Option<u32>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            max_transient_retries: Some(64),
        }
    }
}

impl WaitPolicy {
    pub fn bounded(retries: u32) -> Self {
        Self {
            max_transient_retries: Some(retries),
        }
    }

    /// Retry for as long as wake-ups stay transient.
    pub fn unbounded() -> Self {
        Self {
            max_transient_retries: None,
        }
    }

    fn exhausted(&self, retries: u32) -> bool {
        self.max_transient_retries
            .is_some_and(|limit| retries > limit)
    }
}

/// Runtime options for an [`EffectSession`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub effect_id: u64,
    pub wait: WaitPolicy,
}

impl SessionOptions {
    pub fn with_effect_id(mut self, effect_id: u64) -> Self {
        self.effect_id = effect_id;
        self
    }

    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }
}

/// Counters describing what the session has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub cycles: u64,
    pub buffer_pushes: u64,
    pub status_reads: u64,
    pub transient_wakeups: u64,
}

struct ProcessingChannels {
    status: StatusQueue,
    event_flag: EventFlag,
}

enum Processing {
    Unprepared,
    Ready(ProcessingChannels),
    Failed(HalError),
}

/// Handle on one remote effect and the state of its processing protocol.
pub struct EffectSession<R: RemoteEffect> {
    remote: Option<R>,
    effect_id: u64,
    is_input: bool,
    bindings: BufferBindingTracker,
    processing: Processing,
    wait: WaitPolicy,
    abandoned_cycle: bool,
    stats: SessionStats,
}

impl<R: RemoteEffect> std::fmt::Debug for EffectSession<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectSession")
            .field("effect_id", &self.effect_id)
            .field("is_input", &self.is_input)
            .field("open", &self.remote.is_some())
            .field("bindings", &self.bindings)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn transport_failure(operation: &'static str) -> impl FnOnce(TransportError) -> HalError {
    move |err| {
        error!(operation, %err, "remote effect call failed");
        HalError::FailedTransaction
    }
}

impl<R: RemoteEffect> EffectSession<R> {
    pub fn new(remote: R) -> Self {
        Self::with_options(remote, SessionOptions::default())
    }

    /// Wraps `remote` and classifies it as capture or playback side from its descriptor.
    pub fn with_options(remote: R, options: SessionOptions) -> Self {
        let mut session = Self {
            remote: Some(remote),
            effect_id: options.effect_id,
            is_input: false,
            bindings: BufferBindingTracker::new(),
            processing: Processing::Unprepared,
            wait: options.wait,
            abandoned_cycle: false,
            stats: SessionStats::default(),
        };
        match session.get_descriptor() {
            Ok(descriptor) => session.is_input = descriptor.flags.is_pre_processing(),
            Err(err) => warn!(effect_id = session.effect_id, %err, "could not classify effect"),
        }
        session
    }

    pub fn effect_id(&self) -> u64 {
        self.effect_id
    }

    /// True for capture-side (pre-processing) effects.
    pub fn is_input(&self) -> bool {
        self.is_input
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn bindings(&self) -> &BufferBindingTracker {
        &self.bindings
    }

    pub fn set_in_buffer(&mut self, buffer: Option<Arc<EffectBuffer>>) -> Status {
        self.bindings.set_input(buffer);
        Ok(())
    }

    pub fn set_out_buffer(&mut self, buffer: Option<Arc<EffectBuffer>>) -> Status {
        self.bindings.set_output(buffer);
        Ok(())
    }

    /// Runs one forward processing cycle over the bound buffers.
    pub fn process(&mut self) -> Status {
        self.process_cycle(flags::REQUEST_PROCESS)
    }

    /// Runs one cycle of the reverse (echo reference) path.
    pub fn process_reverse(&mut self) -> Status {
        self.process_cycle(flags::REQUEST_PROCESS_REVERSE)
    }

    fn process_cycle(&mut self, request: u32) -> Status {
        if self.remote.is_none() || self.bindings.bound().is_none() {
            return Err(HalError::NotInitialized);
        }
        self.prepare_for_processing()?;
        if self.abandoned_cycle {
            self.finish_abandoned_cycle()?;
        }
        if self.bindings.needs_refresh() {
            self.push_buffers()?;
        }

        let Processing::Ready(channels) = &self.processing else {
            return Err(HalError::NotInitialized);
        };

        // Samples are already in the shared input buffer; publish them before waking the server.
        fence(Ordering::Release);
        channels.event_flag.wake(request).map_err(|err| {
            error!(effect_id = self.effect_id, %err, "failed to signal processing request");
            HalError::FailedTransaction
        })?;

        match await_completion(channels, self.wait, &mut self.stats) {
            Ok(result) => {
                self.stats.cycles += 1;
                analyze_result(result)
            }
            Err(err) => {
                self.abandoned_cycle = err == HalError::WouldBlock;
                Err(err)
            }
        }
    }

    fn prepare_for_processing(&mut self) -> Status {
        match &self.processing {
            Processing::Ready(_) => return Ok(()),
            Processing::Failed(err) => return Err(*err),
            Processing::Unprepared => {}
        }
        match self.establish_channels() {
            Ok(channels) => {
                debug!(effect_id = self.effect_id, "processing channels established");
                self.processing = Processing::Ready(channels);
                Ok(())
            }
            Err(err) => {
                self.processing = Processing::Failed(err);
                Err(err)
            }
        }
    }

    fn establish_channels(&mut self) -> Status<ProcessingChannels> {
        let remote = self.remote.as_mut().ok_or(HalError::NotInitialized)?;
        let (result, descriptor) = remote
            .prepare_for_processing()
            .map_err(transport_failure("prepare_for_processing"))?;
        analyze_result(result)?;

        let Some(descriptor) = descriptor else {
            error!(effect_id = self.effect_id, "no status queue returned for effect");
            return Err(HalError::NotInitialized);
        };
        let status = StatusQueue::open(&descriptor).map_err(|err| {
            error!(effect_id = self.effect_id, ?err, "failed to map status queue");
            HalError::NotInitialized
        })?;
        if !status.is_valid() {
            error!(effect_id = self.effect_id, "status queue for effect is invalid");
            return Err(HalError::NotInitialized);
        }
        let event_flag = status.event_flag().ok_or_else(|| {
            error!(effect_id = self.effect_id, "event flag creation for effect failed");
            HalError::NotInitialized
        })?;
        Ok(ProcessingChannels { status, event_flag })
    }

    // A cycle given up on after too many transient wake-ups still owes us a
    // completion bit and a status; consume both before starting a new one.
    fn finish_abandoned_cycle(&mut self) -> Status {
        let Processing::Ready(channels) = &self.processing else {
            return Err(HalError::NotInitialized);
        };
        let stale = await_completion(channels, self.wait, &mut self.stats)?;
        debug!(effect_id = self.effect_id, ?stale, "discarded status of abandoned cycle");
        self.abandoned_cycle = false;
        Ok(())
    }

    fn push_buffers(&mut self) -> Status {
        let (input, output) = self
            .bindings
            .bound()
            .map(|(input, output)| (input.descriptor(), output.descriptor()))
            .ok_or(HalError::NotInitialized)?;
        let remote = self.remote.as_mut().ok_or(HalError::NotInitialized)?;
        let result = remote
            .set_process_buffers(&input, &output)
            .map_err(transport_failure("set_process_buffers"))?;
        analyze_result(result)?;
        trace!(
            effect_id = self.effect_id,
            input_frames = input.frame_count,
            output_frames = output.frame_count,
            "pushed process buffers"
        );
        self.bindings.record_pushed();
        self.stats.buffer_pushes += 1;
        Ok(())
    }

    /// Legacy command entry point.
    ///
    /// Configuration commands are decoded and sent as typed configs; every
    /// other code is forwarded as opaque bytes. Returns the number of reply
    /// bytes written, which for forwarded commands is
    /// `min(reply.len(), remote reply length)`.
    pub fn command(
        &mut self,
        code: CommandCode,
        payload: Option<&[u8]>,
        reply: Option<&mut [u8]>,
    ) -> Status<usize> {
        if self.remote.is_none() {
            return Err(HalError::NotInitialized);
        }
        match CommandRoute::for_code(code) {
            CommandRoute::SetConfig(direction) => self.set_config(direction, payload, reply),
            CommandRoute::GetConfig(direction) => self.get_config(direction, reply),
            CommandRoute::Forward => self.forward_command(code, payload, reply),
        }
    }

    fn set_config(
        &mut self,
        direction: ConfigDirection,
        payload: Option<&[u8]>,
        reply: Option<&mut [u8]>,
    ) -> Status<usize> {
        let (Some(payload), Some(reply)) = (payload, reply) else {
            return Err(HalError::BadValue);
        };
        if payload.len() != LEGACY_CONFIG_SIZE || reply.len() != std::mem::size_of::<i32>() {
            return Err(HalError::BadValue);
        }
        let legacy = LegacyEffectConfig::decode(payload)?;
        if legacy.has_buffer_provider() {
            error!(effect_id = self.effect_id, "buffer provider callbacks are not supported");
        }
        let config = effect_config_from_legacy(&legacy, self.is_input);

        let remote = self.remote.as_mut().ok_or(HalError::NotInitialized)?;
        let result = remote
            .set_config(direction, &config)
            .map_err(transport_failure("set_config"))?;
        let status = analyze_result(result);
        reply.copy_from_slice(&status_code(status).to_ne_bytes());
        status.map(|()| reply.len())
    }

    fn get_config(&mut self, direction: ConfigDirection, reply: Option<&mut [u8]>) -> Status<usize> {
        let Some(reply) = reply else {
            return Err(HalError::BadValue);
        };
        if reply.len() != LEGACY_CONFIG_SIZE {
            return Err(HalError::BadValue);
        }
        let remote = self.remote.as_mut().ok_or(HalError::NotInitialized)?;
        let (result, config) = remote
            .get_config(direction)
            .map_err(transport_failure("get_config"))?;
        analyze_result(result)?;
        let Some(config) = config else {
            error!(effect_id = self.effect_id, "effect reported success without a config");
            return Err(HalError::FailedTransaction);
        };
        effect_config_to_legacy(&config).encode(reply)?;
        Ok(reply.len())
    }

    fn forward_command(
        &mut self,
        code: CommandCode,
        payload: Option<&[u8]>,
        reply: Option<&mut [u8]>,
    ) -> Status<usize> {
        let capacity = reply.as_ref().map_or(0, |reply| reply.len());
        let remote = self.remote.as_mut().ok_or(HalError::NotInitialized)?;
        let (status, data) = remote
            .command(
                code,
                payload.unwrap_or_default(),
                u32::try_from(capacity).unwrap_or(u32::MAX),
            )
            .map_err(transport_failure("command"))?;
        HalError::from_code(status)?;

        let copied = capacity.min(data.len());
        if let Some(reply) = reply {
            reply[..copied].copy_from_slice(&data[..copied]);
        }
        trace!(effect_id = self.effect_id, code = code.raw(), copied, "forwarded command");
        Ok(copied)
    }

    pub fn get_descriptor(&mut self) -> Status<EffectDescriptor> {
        let remote = self.remote.as_mut().ok_or(HalError::NotInitialized)?;
        let (result, descriptor) = remote
            .get_descriptor()
            .map_err(transport_failure("get_descriptor"))?;
        analyze_result(result)?;
        descriptor.ok_or(HalError::NotInitialized)
    }

    /// Closes the remote effect; every later call reports `NotInitialized`.
    pub fn close(&mut self) -> Status {
        let Some(remote) = self.remote.take() else {
            return Err(HalError::NotInitialized);
        };
        self.teardown(remote)
    }

    /// Writes the effect's diagnostics into `out`.
    pub fn dump(&mut self, out: &mut dyn Write) -> Status {
        let remote = self.remote.as_mut().ok_or(HalError::NotInitialized)?;
        let result = remote.debug(out);
        // Ping after debug so the server is done with the dump sink before we return.
        if let Err(err) = remote.ping() {
            warn!(effect_id = self.effect_id, %err, "liveness check after dump failed");
        }
        result.map_err(transport_failure("debug"))
    }

    fn teardown(&mut self, mut remote: R) -> Status {
        let result = remote.close();
        self.processing = Processing::Unprepared;
        self.abandoned_cycle = false;
        if let Err(err) = remote.drain() {
            warn!(effect_id = self.effect_id, %err, "failed to drain outstanding calls");
        }
        match result {
            Ok(result) => analyze_result(result),
            Err(err) => Err(transport_failure("close")(err)),
        }
    }
}

fn await_completion(
    channels: &ProcessingChannels,
    policy: WaitPolicy,
    stats: &mut SessionStats,
) -> Status<EffectResult> {
    let mut retries = 0u32;
    loop {
        match channels.event_flag.wait(flags::DONE_PROCESSING, None) {
            Ok(_) => {
                let result = channels
                    .status
                    .read()
                    .unwrap_or(EffectResult::NotInitialized);
                stats.status_reads += 1;
                if matches!(result, EffectResult::Ok | EffectResult::InvalidState) {
                    // Output samples written by the server become visible here.
                    fence(Ordering::Acquire);
                }
                return Ok(result);
            }
            Err(err) if err.is_transient() => {
                stats.transient_wakeups += 1;
                retries += 1;
                if policy.exhausted(retries) {
                    warn!(retries, "giving up on completion after repeated spurious wake-ups");
                    return Err(HalError::WouldBlock);
                }
                trace!(%err, "spurious wake-up, waiting again");
            }
            Err(err) => {
                error!(%err, "waiting for processing completion failed");
                return Err(HalError::FailedTransaction);
            }
        }
    }
}

impl<R: RemoteEffect> Drop for EffectSession<R> {
    fn drop(&mut self) {
        if let Some(remote) = self.remote.take() {
            let _ = self.teardown(remote);
        }
    }
}

/// Session shared between threads behind a mutex.
///
/// The mutex makes the single-cycle-in-flight rule explicit: [`try_process`]
/// reports `WouldBlock` instead of starting a second cycle.
///
/// [`try_process`]: SharedEffectSession::try_process
pub struct SharedEffectSession<R: RemoteEffect> {
    inner: Arc<Mutex<EffectSession<R>>>,
}

impl<R: RemoteEffect> Clone for SharedEffectSession<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteEffect> SharedEffectSession<R> {
    pub fn new(session: EffectSession<R>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, EffectSession<R>> {
        self.inner.lock()
    }

    pub fn process(&self) -> Status {
        self.inner.lock().process()
    }

    pub fn process_reverse(&self) -> Status {
        self.inner.lock().process_reverse()
    }

    pub fn try_process(&self) -> Status {
        self.inner
            .try_lock()
            .ok_or(HalError::WouldBlock)?
            .process()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn channels() -> ProcessingChannels {
        let status = StatusQueue::create().unwrap();
        let event_flag = status.event_flag().unwrap();
        ProcessingChannels { status, event_flag }
    }

    #[test]
    fn wait_policy_limits() {
        assert!(!WaitPolicy::bounded(2).exhausted(2));
        assert!(WaitPolicy::bounded(2).exhausted(3));
        assert!(!WaitPolicy::unbounded().exhausted(u32::MAX));
        assert_eq!(WaitPolicy::default(), WaitPolicy::bounded(64));
    }

    #[test]
    fn completion_reads_exactly_one_status() {
        let channels = channels();
        let mut stats = SessionStats::default();
        assert!(channels.status.write(EffectResult::InvalidState));
        channels.event_flag.wake(flags::DONE_PROCESSING).unwrap();

        let result = await_completion(&channels, WaitPolicy::default(), &mut stats);
        assert_eq!(result, Ok(EffectResult::InvalidState));
        assert_eq!(stats.status_reads, 1);
        assert_eq!(channels.status.available_to_read(), 0);
    }

    #[test]
    fn done_without_status_counts_as_not_initialized() {
        let channels = channels();
        let mut stats = SessionStats::default();
        channels.event_flag.wake(flags::DONE_PROCESSING).unwrap();
        assert_eq!(
            await_completion(&channels, WaitPolicy::default(), &mut stats),
            Ok(EffectResult::NotInitialized)
        );
    }

    #[test]
    fn spurious_wakeups_exhaust_a_bounded_policy() {
        const NOISE: u32 = 1 << 8;
        let channels = channels();
        let noise = channels.event_flag.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_noise = Arc::clone(&stop);
        let toggler = thread::spawn(move || {
            while !stop_noise.load(Ordering::Relaxed) {
                noise.wake(NOISE).unwrap();
                let _ = noise.wait(NOISE, Some(Duration::from_millis(1)));
                thread::sleep(Duration::from_millis(1));
            }
        });

        let mut stats = SessionStats::default();
        let result = await_completion(&channels, WaitPolicy::bounded(3), &mut stats);
        stop.store(true, Ordering::Relaxed);
        toggler.join().unwrap();

        assert_eq!(result, Err(HalError::WouldBlock));
        assert_eq!(stats.transient_wakeups, 4);
        assert_eq!(stats.status_reads, 0);
    }
}
