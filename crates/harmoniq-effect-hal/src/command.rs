use serde::{Deserialize, Serialize};

/// Numeric code of the legacy effect control ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandCode(pub u32);

impl CommandCode {
    pub const INIT: Self = Self(0);
    pub const SET_CONFIG: Self = Self(1);
    pub const RESET: Self = Self(2);
    pub const ENABLE: Self = Self(3);
    pub const DISABLE: Self = Self(4);
    pub const SET_PARAM: Self = Self(5);
    pub const SET_PARAM_DEFERRED: Self = Self(6);
    pub const SET_PARAM_COMMIT: Self = Self(7);
    pub const GET_PARAM: Self = Self(8);
    pub const SET_DEVICE: Self = Self(9);
    pub const SET_VOLUME: Self = Self(10);
    pub const SET_AUDIO_MODE: Self = Self(11);
    pub const SET_CONFIG_REVERSE: Self = Self(12);
    pub const SET_INPUT_DEVICE: Self = Self(13);
    pub const GET_CONFIG: Self = Self(14);
    pub const GET_CONFIG_REVERSE: Self = Self(15);
    /// First code available to effect-specific commands.
    pub const FIRST_PROPRIETARY: Self = Self(0x10000);

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Which of the two mirrored configurations a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigDirection {
    Forward,
    Reverse,
}

/// How the session handles a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRoute {
    GetConfig(ConfigDirection),
    SetConfig(ConfigDirection),
    Forward,
}

impl CommandRoute {
    pub fn for_code(code: CommandCode) -> Self {
        match code {
            CommandCode::SET_CONFIG => CommandRoute::SetConfig(ConfigDirection::Forward),
            CommandCode::SET_CONFIG_REVERSE => CommandRoute::SetConfig(ConfigDirection::Reverse),
            CommandCode::GET_CONFIG => CommandRoute::GetConfig(ConfigDirection::Forward),
            CommandCode::GET_CONFIG_REVERSE => CommandRoute::GetConfig(ConfigDirection::Reverse),
            _ => CommandRoute::Forward,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_codes_are_intercepted() {
        assert_eq!(
            CommandRoute::for_code(CommandCode::SET_CONFIG_REVERSE),
            CommandRoute::SetConfig(ConfigDirection::Reverse)
        );
        assert_eq!(
            CommandRoute::for_code(CommandCode::GET_CONFIG),
            CommandRoute::GetConfig(ConfigDirection::Forward)
        );
        for code in [
            CommandCode::INIT,
            CommandCode::ENABLE,
            CommandCode::GET_PARAM,
            CommandCode::SET_INPUT_DEVICE,
            CommandCode::FIRST_PROPRIETARY,
        ] {
            assert_eq!(CommandRoute::for_code(code), CommandRoute::Forward);
        }
    }
}
