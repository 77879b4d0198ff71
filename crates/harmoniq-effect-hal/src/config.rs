//! Effect configuration in two shapes.
//!
//! [`LegacyEffectConfig`] is the flat, fixed-size payload carried by the legacy
//! `SET_CONFIG`/`GET_CONFIG` commands. [`EffectConfig`] is the typed form that
//! crosses the transport. The conversion functions are pure; payload sizes are
//! validated on decode instead of reinterpreting raw bytes.

use serde::{Deserialize, Serialize};

use crate::error::{HalError, Status};

/// Size of one flat buffer configuration.
pub const LEGACY_BUFFER_CONFIG_SIZE: usize = 32;
/// Size of the flat effect configuration (input followed by output).
pub const LEGACY_CONFIG_SIZE: usize = 2 * LEGACY_BUFFER_CONFIG_SIZE;

/// Bits of the per-buffer `mask` field telling which fields are meaningful.
pub mod config_mask {
    pub const BUFFER: u16 = 0x0001;
    pub const SAMPLING_RATE: u16 = 0x0002;
    pub const CHANNELS: u16 = 0x0004;
    pub const FORMAT: u16 = 0x0008;
    pub const ACCESS_MODE: u16 = 0x0010;
    pub const PROVIDER: u16 = 0x0020;
    pub const ALL: u16 = BUFFER | SAMPLING_RATE | CHANNELS | FORMAT | ACCESS_MODE | PROVIDER;
}

/// Flat per-direction configuration.
///
/// Layout (native endian): `frame_count: u32`, `sampling_rate: u32`,
/// `channels: u32`, `format: u8`, `access_mode: u8`, `mask: u16`,
/// `get_buffer: u64`, `release_buffer: u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyBufferConfig {
    pub frame_count: u32,
    pub sampling_rate: u32,
    pub channels: u32,
    pub format: u8,
    pub access_mode: u8,
    pub mask: u16,
    pub get_buffer: u64,
    pub release_buffer: u64,
}

impl LegacyBufferConfig {
    fn decode(bytes: &[u8]) -> Self {
        let u32_at = |at: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[at..at + 4]);
            u32::from_ne_bytes(raw)
        };
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_ne_bytes(raw)
        };
        Self {
            frame_count: u32_at(0),
            sampling_rate: u32_at(4),
            channels: u32_at(8),
            format: bytes[12],
            access_mode: bytes[13],
            mask: u16::from_ne_bytes([bytes[14], bytes[15]]),
            get_buffer: u64_at(16),
            release_buffer: u64_at(24),
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.frame_count.to_ne_bytes());
        out[4..8].copy_from_slice(&self.sampling_rate.to_ne_bytes());
        out[8..12].copy_from_slice(&self.channels.to_ne_bytes());
        out[12] = self.format;
        out[13] = self.access_mode;
        out[14..16].copy_from_slice(&self.mask.to_ne_bytes());
        out[16..24].copy_from_slice(&self.get_buffer.to_ne_bytes());
        out[24..32].copy_from_slice(&self.release_buffer.to_ne_bytes());
    }

    /// Legacy pull/push callbacks supplied with the configuration.
    pub fn has_buffer_provider(&self) -> bool {
        self.get_buffer != 0 || self.release_buffer != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyEffectConfig {
    pub input: LegacyBufferConfig,
    pub output: LegacyBufferConfig,
}

impl LegacyEffectConfig {
    pub fn decode(bytes: &[u8]) -> Status<Self> {
        if bytes.len() != LEGACY_CONFIG_SIZE {
            return Err(HalError::BadValue);
        }
        let (input, output) = bytes.split_at(LEGACY_BUFFER_CONFIG_SIZE);
        Ok(Self {
            input: LegacyBufferConfig::decode(input),
            output: LegacyBufferConfig::decode(output),
        })
    }

    pub fn encode(&self, out: &mut [u8]) -> Status {
        if out.len() != LEGACY_CONFIG_SIZE {
            return Err(HalError::BadValue);
        }
        let (input, output) = out.split_at_mut(LEGACY_BUFFER_CONFIG_SIZE);
        self.input.encode(input);
        self.output.encode(output);
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; LEGACY_CONFIG_SIZE] {
        let mut bytes = [0u8; LEGACY_CONFIG_SIZE];
        let (input, output) = bytes.split_at_mut(LEGACY_BUFFER_CONFIG_SIZE);
        self.input.encode(input);
        self.output.encode(output);
        bytes
    }

    pub fn has_buffer_provider(&self) -> bool {
        self.input.has_buffer_provider() || self.output.has_buffer_provider()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioFormat {
    Pcm16Bit,
    Pcm8Bit,
    Pcm32Bit,
    Pcm8_24Bit,
    Float,
    Pcm24BitPacked,
    Other(u8),
}

impl AudioFormat {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x1 => AudioFormat::Pcm16Bit,
            0x2 => AudioFormat::Pcm8Bit,
            0x3 => AudioFormat::Pcm32Bit,
            0x4 => AudioFormat::Pcm8_24Bit,
            0x5 => AudioFormat::Float,
            0x6 => AudioFormat::Pcm24BitPacked,
            other => AudioFormat::Other(other),
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            AudioFormat::Pcm16Bit => 0x1,
            AudioFormat::Pcm8Bit => 0x2,
            AudioFormat::Pcm32Bit => 0x3,
            AudioFormat::Pcm8_24Bit => 0x4,
            AudioFormat::Float => 0x5,
            AudioFormat::Pcm24BitPacked => 0x6,
            AudioFormat::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Write,
    Read,
    Accumulate,
    /// Value outside the known set, carried through unchanged.
    Other(u8),
}

impl AccessMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => AccessMode::Write,
            1 => AccessMode::Read,
            2 => AccessMode::Accumulate,
            other => AccessMode::Other(other),
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            AccessMode::Write => 0,
            AccessMode::Read => 1,
            AccessMode::Accumulate => 2,
            AccessMode::Other(raw) => raw,
        }
    }
}

/// Channel mask tagged with the direction it was declared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelMask {
    Input(u32),
    Output(u32),
}

impl ChannelMask {
    pub const IN_STEREO: u32 = 0x0c;
    pub const OUT_STEREO: u32 = 0x03;

    pub fn bits(self) -> u32 {
        match self {
            ChannelMask::Input(bits) | ChannelMask::Output(bits) => bits,
        }
    }

    pub fn channel_count(self) -> u32 {
        self.bits().count_ones()
    }
}

/// Typed per-direction configuration exchanged with the remote effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectBufferConfig {
    pub frame_count: u32,
    pub sampling_rate_hz: u32,
    pub channel_mask: ChannelMask,
    pub format: AudioFormat,
    pub access_mode: AccessMode,
    pub mask: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectConfig {
    pub input: EffectBufferConfig,
    pub output: EffectBufferConfig,
}

impl Default for EffectConfig {
    fn default() -> Self {
        let mask = config_mask::ALL & !config_mask::PROVIDER;
        Self {
            input: EffectBufferConfig {
                frame_count: 0,
                sampling_rate_hz: 48_000,
                channel_mask: ChannelMask::Output(ChannelMask::OUT_STEREO),
                format: AudioFormat::Float,
                access_mode: AccessMode::Read,
                mask,
            },
            output: EffectBufferConfig {
                frame_count: 0,
                sampling_rate_hz: 48_000,
                channel_mask: ChannelMask::Output(ChannelMask::OUT_STEREO),
                format: AudioFormat::Float,
                access_mode: AccessMode::Accumulate,
                mask,
            },
        }
    }
}

fn buffer_config_from_legacy(legacy: &LegacyBufferConfig, is_input: bool) -> EffectBufferConfig {
    let channel_mask = if is_input {
        ChannelMask::Input(legacy.channels)
    } else {
        ChannelMask::Output(legacy.channels)
    };
    EffectBufferConfig {
        frame_count: legacy.frame_count,
        sampling_rate_hz: legacy.sampling_rate,
        channel_mask,
        format: AudioFormat::from_raw(legacy.format),
        access_mode: AccessMode::from_raw(legacy.access_mode),
        mask: legacy.mask & !config_mask::PROVIDER,
    }
}

fn buffer_config_to_legacy(config: &EffectBufferConfig) -> LegacyBufferConfig {
    LegacyBufferConfig {
        frame_count: config.frame_count,
        sampling_rate: config.sampling_rate_hz,
        channels: config.channel_mask.bits(),
        format: config.format.as_raw(),
        access_mode: config.access_mode.as_raw(),
        mask: config.mask,
        get_buffer: 0,
        release_buffer: 0,
    }
}

/// Converts the flat payload; `is_input` selects capture-side channel masks.
///
/// Buffer-provider callbacks are dropped, the transport cannot carry them.
pub fn effect_config_from_legacy(legacy: &LegacyEffectConfig, is_input: bool) -> EffectConfig {
    EffectConfig {
        input: buffer_config_from_legacy(&legacy.input, is_input),
        output: buffer_config_from_legacy(&legacy.output, is_input),
    }
}

pub fn effect_config_to_legacy(config: &EffectConfig) -> LegacyEffectConfig {
    LegacyEffectConfig {
        input: buffer_config_to_legacy(&config.input),
        output: buffer_config_to_legacy(&config.output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn legacy() -> LegacyEffectConfig {
        LegacyEffectConfig {
            input: LegacyBufferConfig {
                frame_count: 256,
                sampling_rate: 44_100,
                channels: ChannelMask::IN_STEREO,
                format: 0x5,
                access_mode: 1,
                mask: config_mask::ALL,
                get_buffer: 0xdead_beef,
                release_buffer: 0,
            },
            output: LegacyBufferConfig {
                frame_count: 256,
                sampling_rate: 44_100,
                channels: ChannelMask::IN_STEREO,
                format: 0x1,
                access_mode: 2,
                mask: config_mask::SAMPLING_RATE | config_mask::FORMAT,
                get_buffer: 0,
                release_buffer: 0,
            },
        }
    }

    #[test]
    fn decode_rejects_wrong_sizes() {
        assert_eq!(LegacyEffectConfig::decode(&[0u8; 32]), Err(HalError::BadValue));
        assert_eq!(
            LegacyEffectConfig::decode(&[0u8; LEGACY_CONFIG_SIZE + 1]),
            Err(HalError::BadValue)
        );
        let mut short = [0u8; 63];
        assert_eq!(legacy().encode(&mut short), Err(HalError::BadValue));
    }

    #[test]
    fn flat_layout_places_fields_at_fixed_offsets() {
        let bytes = legacy().to_bytes();
        assert_eq!(&bytes[0..4], &256u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &44_100u32.to_ne_bytes());
        assert_eq!(bytes[12], 0x5);
        assert_eq!(&bytes[16..24], &0xdead_beefu64.to_ne_bytes());
        assert_eq!(bytes[32 + 13], 2);
        assert_eq!(LegacyEffectConfig::decode(&bytes).unwrap(), legacy());
    }

    #[test]
    fn capture_effects_get_input_channel_masks() {
        let config = effect_config_from_legacy(&legacy(), true);
        assert_eq!(config.input.channel_mask, ChannelMask::Input(ChannelMask::IN_STEREO));
        assert_eq!(config.output.channel_mask, ChannelMask::Input(ChannelMask::IN_STEREO));
        let config = effect_config_from_legacy(&legacy(), false);
        assert_eq!(config.input.channel_mask, ChannelMask::Output(ChannelMask::IN_STEREO));
    }

    #[test]
    fn provider_callbacks_do_not_survive_conversion() {
        let original = legacy();
        assert!(original.has_buffer_provider());
        let back = effect_config_to_legacy(&effect_config_from_legacy(&original, false));
        assert!(!back.has_buffer_provider());
        assert_eq!(back.input.mask, config_mask::ALL & !config_mask::PROVIDER);
        assert_eq!(back.input.format, AudioFormat::Float.as_raw());
        assert_eq!(back.output.access_mode, AccessMode::Accumulate.as_raw());
    }

    #[test]
    fn unknown_access_mode_is_preserved() {
        let mut raw = legacy();
        raw.input.access_mode = 7;
        let config = effect_config_from_legacy(&raw, false);
        assert_eq!(config.input.access_mode, AccessMode::Other(7));
        assert_eq!(effect_config_to_legacy(&config).input.access_mode, 7);
        assert_eq!(AccessMode::from_raw(0), AccessMode::Write);
    }
}
