use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Capability and placement flags of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EffectFlags(pub u32);

impl EffectFlags {
    pub const TYPE_MASK: u32 = 0x7;
    pub const TYPE_INSERT: u32 = 0;
    pub const TYPE_AUXILIARY: u32 = 1;
    pub const TYPE_REPLACE: u32 = 2;
    pub const TYPE_PRE_PROC: u32 = 3;
    pub const TYPE_POST_PROC: u32 = 4;

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether the effect sits on the capture path (pre-processing).
    pub fn is_pre_processing(self) -> bool {
        self.0 & Self::TYPE_PRE_PROC == Self::TYPE_PRE_PROC
    }
}

/// Static description of an effect implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectDescriptor {
    pub type_uuid: Uuid,
    pub uuid: Uuid,
    pub api_version: u32,
    pub flags: EffectFlags,
    pub cpu_load: u16,
    pub memory_usage: u16,
    pub name: String,
    pub implementor: String,
}

impl EffectDescriptor {
    pub fn new(name: impl Into<String>, flags: EffectFlags) -> Self {
        Self {
            type_uuid: Uuid::nil(),
            uuid: Uuid::nil(),
            api_version: 0x0003_0000,
            flags,
            cpu_load: 0,
            memory_usage: 0,
            name: name.into(),
            implementor: "Harmoniq Studio".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pre_processing_type_is_input() {
        assert!(EffectFlags(EffectFlags::TYPE_PRE_PROC).is_pre_processing());
        assert!(!EffectFlags(EffectFlags::TYPE_INSERT).is_pre_processing());
        assert!(!EffectFlags(EffectFlags::TYPE_POST_PROC).is_pre_processing());
        assert!(!EffectFlags(EffectFlags::TYPE_REPLACE).is_pre_processing());
    }
}
