//! Word-based cross-process wait/wake primitive.
//!
//! An [`EventFlag`] is a 32-bit word inside a shared region. Each bit is an
//! independent event: [`EventFlag::wake`] sets bits and wakes sleepers,
//! [`EventFlag::wait`] consumes any of the requested bits, sleeping on the word
//! until one shows up. On Linux sleeping is a shared (non-private) futex so it
//! works across processes mapping the same file.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::shm::SharedRegion;

/// Bits used by the effect processing handshake.
pub mod flags {
    pub const REQUEST_PROCESS: u32 = 1 << 0;
    pub const REQUEST_PROCESS_REVERSE: u32 = 1 << 1;
    pub const REQUEST_QUIT: u32 = 1 << 2;
    pub const REQUEST_PROCESS_ALL: u32 = REQUEST_PROCESS | REQUEST_PROCESS_REVERSE | REQUEST_QUIT;
    pub const DONE_PROCESSING: u32 = 1 << 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("wait interrupted before any requested bit was set")]
    Interrupted,
    #[error("event word changed before the waiter could sleep")]
    WouldBlock,
    #[error("wait timed out")]
    TimedOut,
    #[error("empty bit mask")]
    InvalidArgument,
    #[error("futex call failed with errno {0}")]
    Os(i32),
}

impl WaitError {
    /// Interruptions that warrant waiting again without re-signalling.
    pub fn is_transient(self) -> bool {
        matches!(self, WaitError::Interrupted | WaitError::WouldBlock)
    }
}

/// Handle on an event word embedded in a shared region.
#[derive(Debug, Clone)]
pub struct EventFlag {
    region: Arc<SharedRegion>,
    offset: usize,
}

impl EventFlag {
    /// Binds to the word at `offset` inside `region`.
    ///
    /// Returns `None` when the word does not fit or is misaligned.
    pub fn from_region(region: Arc<SharedRegion>, offset: usize) -> Option<Self> {
        let size = std::mem::size_of::<AtomicU32>();
        if offset % std::mem::align_of::<AtomicU32>() != 0 || offset + size > region.len() {
            return None;
        }
        Some(Self { region, offset })
    }

    fn word(&self) -> &AtomicU32 {
        unsafe { &*(self.region.as_ptr().add(self.offset) as *const AtomicU32) }
    }

    /// Raw bits currently set, for diagnostics.
    pub fn peek(&self) -> u32 {
        self.word().load(Ordering::SeqCst)
    }

    /// Sets `bits` and wakes every waiter if any of them was previously clear.
    pub fn wake(&self, bits: u32) -> Result<(), WaitError> {
        if bits == 0 {
            return Err(WaitError::InvalidArgument);
        }
        let word = self.word();
        let old = word.fetch_or(bits, Ordering::SeqCst);
        if !old & bits != 0 {
            sys::futex_wake(word)?;
        }
        Ok(())
    }

    /// Waits for any bit in `bits`, clears those bits and returns them.
    ///
    /// A wake-up that finds none of the requested bits set is reported as
    /// [`WaitError::Interrupted`] (or the futex error that ended the sleep);
    /// callers decide whether to wait again.
    pub fn wait(&self, bits: u32, timeout: Option<Duration>) -> Result<u32, WaitError> {
        if bits == 0 {
            return Err(WaitError::InvalidArgument);
        }
        let word = self.word();
        let old = word.fetch_and(!bits, Ordering::SeqCst);
        if old & bits != 0 {
            return Ok(old & bits);
        }

        let slept = sys::futex_wait(word, old & !bits, timeout);

        let old = word.fetch_and(!bits, Ordering::SeqCst);
        if old & bits != 0 {
            return Ok(old & bits);
        }
        match slept {
            Ok(()) => Err(WaitError::Interrupted),
            Err(err) => Err(err),
        }
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::WaitError;

    pub(super) fn futex_wait(
        word: &AtomicU32,
        expected: u32,
        timeout: Option<Duration>,
    ) -> Result<(), WaitError> {
        let timespec = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32,
                libc::FUTEX_WAIT,
                expected,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret == -1 {
            return Err(last_error());
        }
        Ok(())
    }

    pub(super) fn futex_wake(word: &AtomicU32) -> Result<(), WaitError> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32,
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret == -1 {
            return Err(last_error());
        }
        Ok(())
    }

    fn last_error() -> WaitError {
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => WaitError::WouldBlock,
            Some(libc::EINTR) => WaitError::Interrupted,
            Some(libc::ETIMEDOUT) => WaitError::TimedOut,
            Some(code) => WaitError::Os(code),
            None => WaitError::Os(0),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use super::WaitError;

    const SPINS_BEFORE_SLEEP: u32 = 64;

    // Polling stand-in for platforms without a shared futex.
    pub(super) fn futex_wait(
        word: &AtomicU32,
        expected: u32,
        timeout: Option<Duration>,
    ) -> Result<(), WaitError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut spins = 0;
        while word.load(Ordering::Acquire) == expected {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(WaitError::TimedOut);
            }
            if spins < SPINS_BEFORE_SLEEP {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
        Ok(())
    }

    pub(super) fn futex_wake(_word: &AtomicU32) -> Result<(), WaitError> {
        Ok(())
    }
}
