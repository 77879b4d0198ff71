use std::io::Write;

use thiserror::Error;

use crate::buffer::EffectBufferDescriptor;
use crate::command::{CommandCode, ConfigDirection};
use crate::config::EffectConfig;
use crate::descriptor::EffectDescriptor;
use crate::error::EffectResult;
use crate::status_queue::StatusQueueDescriptor;

/// The remote call could not be delivered or its reply could not be read.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote effect disconnected")]
    Disconnected,
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode or decode a message: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unexpected reply: {0}")]
    Protocol(String),
}

/// Client view of one effect instance living in another process.
///
/// Every call can fail at the transport layer independently of the status the
/// effect itself reports, hence the nested results.
pub trait RemoteEffect {
    /// Sets up the status queue and event flag used by the processing handshake.
    fn prepare_for_processing(
        &mut self,
    ) -> Result<(EffectResult, Option<StatusQueueDescriptor>), TransportError>;

    fn set_process_buffers(
        &mut self,
        input: &EffectBufferDescriptor,
        output: &EffectBufferDescriptor,
    ) -> Result<EffectResult, TransportError>;

    fn get_descriptor(&mut self) -> Result<(EffectResult, Option<EffectDescriptor>), TransportError>;

    /// Opaque legacy command; returns the effect's status and reply bytes.
    fn command(
        &mut self,
        code: CommandCode,
        data: &[u8],
        reply_capacity: u32,
    ) -> Result<(i32, Vec<u8>), TransportError>;

    fn get_config(
        &mut self,
        direction: ConfigDirection,
    ) -> Result<(EffectResult, Option<EffectConfig>), TransportError>;

    fn set_config(
        &mut self,
        direction: ConfigDirection,
        config: &EffectConfig,
    ) -> Result<EffectResult, TransportError>;

    fn close(&mut self) -> Result<EffectResult, TransportError>;

    /// Writes the effect's diagnostic dump into `out`.
    fn debug(&mut self, out: &mut dyn Write) -> Result<(), TransportError>;

    /// Liveness check.
    fn ping(&mut self) -> Result<(), TransportError>;

    /// Completes every call still buffered on the client side.
    fn drain(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T: RemoteEffect + ?Sized> RemoteEffect for Box<T> {
    fn prepare_for_processing(
        &mut self,
    ) -> Result<(EffectResult, Option<StatusQueueDescriptor>), TransportError> {
        (**self).prepare_for_processing()
    }

    fn set_process_buffers(
        &mut self,
        input: &EffectBufferDescriptor,
        output: &EffectBufferDescriptor,
    ) -> Result<EffectResult, TransportError> {
        (**self).set_process_buffers(input, output)
    }

    fn get_descriptor(&mut self) -> Result<(EffectResult, Option<EffectDescriptor>), TransportError> {
        (**self).get_descriptor()
    }

    fn command(
        &mut self,
        code: CommandCode,
        data: &[u8],
        reply_capacity: u32,
    ) -> Result<(i32, Vec<u8>), TransportError> {
        (**self).command(code, data, reply_capacity)
    }

    fn get_config(
        &mut self,
        direction: ConfigDirection,
    ) -> Result<(EffectResult, Option<EffectConfig>), TransportError> {
        (**self).get_config(direction)
    }

    fn set_config(
        &mut self,
        direction: ConfigDirection,
        config: &EffectConfig,
    ) -> Result<EffectResult, TransportError> {
        (**self).set_config(direction, config)
    }

    fn close(&mut self) -> Result<EffectResult, TransportError> {
        (**self).close()
    }

    fn debug(&mut self, out: &mut dyn Write) -> Result<(), TransportError> {
        (**self).debug(out)
    }

    fn ping(&mut self) -> Result<(), TransportError> {
        (**self).ping()
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        (**self).drain()
    }
}
