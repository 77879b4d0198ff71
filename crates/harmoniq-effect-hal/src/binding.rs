use std::sync::Arc;

use crate::buffer::EffectBuffer;

/// Decides when the remote side needs fresh buffer descriptors.
///
/// The dirty flag covers changes of *which* region is bound; frame counts are
/// compared on every query against the values recorded at the last push, so a
/// block-size change on an unchanged region also forces a refresh.
#[derive(Debug)]
pub struct BufferBindingTracker {
    input: Option<Arc<EffectBuffer>>,
    output: Option<Arc<EffectBuffer>>,
    dirty: bool,
    pushed_frames: Option<(u32, u32)>,
}

impl Default for BufferBindingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferBindingTracker {
    pub fn new() -> Self {
        Self {
            input: None,
            output: None,
            dirty: true,
            pushed_frames: None,
        }
    }

    pub fn set_input(&mut self, buffer: Option<Arc<EffectBuffer>>) {
        if !self.dirty {
            self.dirty = !same_region(&self.input, &buffer);
        }
        self.input = buffer;
    }

    pub fn set_output(&mut self, buffer: Option<Arc<EffectBuffer>>) {
        if !self.dirty {
            self.dirty = !same_region(&self.output, &buffer);
        }
        self.output = buffer;
    }

    pub fn input(&self) -> Option<&Arc<EffectBuffer>> {
        self.input.as_ref()
    }

    pub fn output(&self) -> Option<&Arc<EffectBuffer>> {
        self.output.as_ref()
    }

    /// Both sides bound.
    pub fn bound(&self) -> Option<(&Arc<EffectBuffer>, &Arc<EffectBuffer>)> {
        Some((self.input.as_ref()?, self.output.as_ref()?))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn needs_refresh(&self) -> bool {
        if self.dirty {
            return true;
        }
        match (self.bound(), self.pushed_frames) {
            (Some((input, output)), Some((pushed_in, pushed_out))) => {
                input.frame_count() != pushed_in || output.frame_count() != pushed_out
            }
            _ => true,
        }
    }

    /// Called after the remote side accepted the current bindings.
    pub fn record_pushed(&mut self) {
        if let Some((input, output)) = self.bound() {
            self.pushed_frames = Some((input.frame_count(), output.frame_count()));
            self.dirty = false;
        }
    }
}

fn same_region(current: &Option<Arc<EffectBuffer>>, next: &Option<Arc<EffectBuffer>>) -> bool {
    match (current, next) {
        (Some(current), Some(next)) => current.id() == next.id(),
        (None, None) => true,
        _ => false,
    }
}
