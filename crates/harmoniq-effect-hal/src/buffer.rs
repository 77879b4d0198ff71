use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::shm::SharedRegion;

static NEXT_REGION: AtomicU64 = AtomicU64::new(1);

fn next_region_id() -> u64 {
    (u64::from(std::process::id()) << 32) | NEXT_REGION.fetch_add(1, Ordering::Relaxed)
}

/// Wire form of an effect buffer, enough for the other party to map it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EffectBufferDescriptor {
    pub id: u64,
    pub path: PathBuf,
    pub channels: u32,
    pub capacity_frames: u32,
    pub frame_count: u32,
}

/// Interleaved `f32` audio buffer living in shared memory.
///
/// The frame count can shrink or grow (up to the capacity) between blocks when
/// the pipeline changes its block size. Identity is the region id: two handles
/// mapping the same region compare equal through [`EffectBuffer::id`].
#[derive(Debug)]
pub struct EffectBuffer {
    id: u64,
    region: SharedRegion,
    channels: u32,
    capacity_frames: u32,
    frame_count: AtomicU32,
}

impl EffectBuffer {
    pub fn create(channels: u32, frames: u32) -> Result<Self> {
        ensure!(channels > 0, "effect buffer needs at least one channel");
        let len = channels as usize * frames.max(1) as usize * std::mem::size_of::<f32>();
        let region = SharedRegion::create("harmoniq-effect-buffer", len)?;
        Ok(Self {
            id: next_region_id(),
            region,
            channels,
            capacity_frames: frames,
            frame_count: AtomicU32::new(frames),
        })
    }

    /// Maps a buffer described by the other party.
    pub fn open(descriptor: &EffectBufferDescriptor) -> Result<Self> {
        ensure!(
            descriptor.frame_count <= descriptor.capacity_frames,
            "frame count {} exceeds buffer capacity {}",
            descriptor.frame_count,
            descriptor.capacity_frames
        );
        let region = SharedRegion::open(&descriptor.path)?;
        let needed = descriptor.channels as usize
            * descriptor.capacity_frames as usize
            * std::mem::size_of::<f32>();
        ensure!(
            region.len() >= needed,
            "shared buffer {} is smaller than described",
            descriptor.path.display()
        );
        Ok(Self {
            id: descriptor.id,
            region,
            channels: descriptor.channels,
            capacity_frames: descriptor.capacity_frames,
            frame_count: AtomicU32::new(descriptor.frame_count),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn capacity_frames(&self) -> u32 {
        self.capacity_frames
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn set_frame_count(&self, frames: u32) -> Result<()> {
        ensure!(
            frames <= self.capacity_frames,
            "frame count {frames} exceeds buffer capacity {}",
            self.capacity_frames
        );
        self.frame_count.store(frames, Ordering::Relaxed);
        Ok(())
    }

    /// Number of interleaved samples covered by the current frame count.
    pub fn sample_len(&self) -> usize {
        self.frame_count() as usize * self.channels as usize
    }

    pub fn descriptor(&self) -> EffectBufferDescriptor {
        EffectBufferDescriptor {
            id: self.id,
            path: self.region.path().to_path_buf(),
            channels: self.channels,
            capacity_frames: self.capacity_frames,
            frame_count: self.frame_count(),
        }
    }

    /// Writes interleaved samples at the start of the buffer.
    ///
    /// Only the party that owns the write role for this buffer may call this,
    /// and never while the other party is processing the block.
    pub fn write_interleaved(&self, samples: &[f32]) -> Result<()> {
        ensure!(
            samples.len() <= self.capacity_samples(),
            "audio block of {} samples exceeds buffer capacity",
            samples.len()
        );
        unsafe {
            std::ptr::copy_nonoverlapping(samples.as_ptr(), self.data_ptr(), samples.len());
        }
        Ok(())
    }

    /// Copies interleaved samples out of the start of the buffer.
    pub fn read_interleaved(&self, out: &mut [f32]) -> Result<()> {
        ensure!(
            out.len() <= self.capacity_samples(),
            "read of {} samples exceeds buffer capacity",
            out.len()
        );
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr(), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Borrows the first `len` samples.
    ///
    /// # Safety
    /// The other party must not write the region while the slice is alive.
    pub(crate) unsafe fn samples(&self, len: usize) -> &[f32] {
        std::slice::from_raw_parts(self.data_ptr(), len.min(self.capacity_samples()))
    }

    /// Mutably borrows the first `len` samples.
    ///
    /// # Safety
    /// The caller holds the write role for the region and no other slice over
    /// it is alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn samples_mut(&self, len: usize) -> &mut [f32] {
        std::slice::from_raw_parts_mut(self.data_ptr(), len.min(self.capacity_samples()))
    }

    fn capacity_samples(&self) -> usize {
        self.capacity_frames as usize * self.channels as usize
    }

    fn data_ptr(&self) -> *mut f32 {
        self.region.as_mut_ptr() as *mut f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opened_buffer_shares_identity_and_samples() {
        let buffer = EffectBuffer::create(2, 8).unwrap();
        buffer.write_interleaved(&[0.25; 16]).unwrap();

        let remote = EffectBuffer::open(&buffer.descriptor()).unwrap();
        assert_eq!(remote.id(), buffer.id());
        let mut copy = [0.0f32; 16];
        remote.read_interleaved(&mut copy).unwrap();
        assert_eq!(copy, [0.25; 16]);
    }

    #[test]
    fn frame_count_is_bounded_by_capacity() {
        let buffer = EffectBuffer::create(1, 128).unwrap();
        buffer.set_frame_count(64).unwrap();
        assert_eq!(buffer.frame_count(), 64);
        assert_eq!(buffer.descriptor().frame_count, 64);
        assert!(buffer.set_frame_count(129).is_err());
        assert_eq!(buffer.frame_count(), 64);
    }

    #[test]
    fn distinct_buffers_have_distinct_ids() {
        let a = EffectBuffer::create(1, 4).unwrap();
        let b = EffectBuffer::create(1, 4).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
