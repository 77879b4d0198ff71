use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::error::EffectResult;
use crate::event_flag::EventFlag;
use crate::shm::SharedRegion;

const QUEUE_MAGIC: u32 = 0x4851_5351;

// The event flag word must stay at offset 0.
#[repr(C)]
struct QueueRegion {
    event_flag: AtomicU32,
    magic: AtomicU32,
    write_count: AtomicU32,
    read_count: AtomicU32,
    slot: AtomicU32,
}

/// Describes a status queue that can be opened from another process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusQueueDescriptor {
    pub path: PathBuf,
}

/// Single-slot, single-producer/single-consumer channel of [`EffectResult`]s.
///
/// The server is the only writer and the client the only reader. The region
/// also hosts the event flag word the two sides use to signal each other.
#[derive(Debug, Clone)]
pub struct StatusQueue {
    region: Arc<SharedRegion>,
}

impl StatusQueue {
    pub fn create() -> Result<Self> {
        let region = SharedRegion::create(
            "harmoniq-effect-status",
            std::mem::size_of::<QueueRegion>(),
        )?;
        let queue = Self {
            region: Arc::new(region),
        };
        queue.layout().magic.store(QUEUE_MAGIC, Ordering::Release);
        Ok(queue)
    }

    pub fn open(descriptor: &StatusQueueDescriptor) -> Result<Self> {
        let region = SharedRegion::open(&descriptor.path)?;
        ensure!(
            region.len() >= std::mem::size_of::<QueueRegion>(),
            "status queue region {} is truncated",
            descriptor.path.display()
        );
        Ok(Self {
            region: Arc::new(region),
        })
    }

    pub fn descriptor(&self) -> StatusQueueDescriptor {
        StatusQueueDescriptor {
            path: self.region.path().to_path_buf(),
        }
    }

    fn layout(&self) -> &QueueRegion {
        unsafe { &*(self.region.as_ptr() as *const QueueRegion) }
    }

    /// True once the creator has initialised the region.
    pub fn is_valid(&self) -> bool {
        self.layout().magic.load(Ordering::Acquire) == QUEUE_MAGIC
    }

    /// Event flag backed by the word embedded in this queue's region.
    pub fn event_flag(&self) -> Option<EventFlag> {
        EventFlag::from_region(Arc::clone(&self.region), 0)
    }

    /// Publishes one result; fails when the previous one was not consumed yet.
    pub fn write(&self, result: EffectResult) -> bool {
        let header = self.layout();
        let written = header.write_count.load(Ordering::Relaxed);
        let read = header.read_count.load(Ordering::Acquire);
        if written.wrapping_sub(read) >= 1 {
            return false;
        }
        header.slot.store(result.as_raw(), Ordering::Relaxed);
        header
            .write_count
            .store(written.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumes the pending result, if any.
    pub fn read(&self) -> Option<EffectResult> {
        let header = self.layout();
        let read = header.read_count.load(Ordering::Relaxed);
        let written = header.write_count.load(Ordering::Acquire);
        if written == read {
            return None;
        }
        let raw = header.slot.load(Ordering::Relaxed);
        header
            .read_count
            .store(read.wrapping_add(1), Ordering::Release);
        Some(EffectResult::from_raw(raw))
    }

    pub fn available_to_read(&self) -> usize {
        let header = self.layout();
        header
            .write_count
            .load(Ordering::Acquire)
            .wrapping_sub(header.read_count.load(Ordering::Acquire)) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_slot_rejects_second_write() {
        let queue = StatusQueue::create().unwrap();
        assert!(queue.write(EffectResult::Ok));
        assert!(!queue.write(EffectResult::InvalidState));
        assert_eq!(queue.available_to_read(), 1);
        assert_eq!(queue.read(), Some(EffectResult::Ok));
        assert_eq!(queue.read(), None);
        assert!(queue.write(EffectResult::InvalidState));
        assert_eq!(queue.read(), Some(EffectResult::InvalidState));
    }

    #[test]
    fn reader_in_other_mapping_sees_results() {
        let server = StatusQueue::create().unwrap();
        let client = StatusQueue::open(&server.descriptor()).unwrap();
        assert!(client.is_valid());
        assert!(server.write(EffectResult::NotSupported));
        assert_eq!(client.read(), Some(EffectResult::NotSupported));
        assert_eq!(server.available_to_read(), 0);
    }

    #[test]
    fn event_flag_word_is_shared() {
        let server = StatusQueue::create().unwrap();
        let client = StatusQueue::open(&server.descriptor()).unwrap();
        let server_flag = server.event_flag().unwrap();
        let client_flag = client.event_flag().unwrap();
        server_flag.wake(1 << 4).unwrap();
        assert_eq!(client_flag.peek(), 1 << 4);
    }
}
