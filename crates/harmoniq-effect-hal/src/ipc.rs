use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::buffer::EffectBufferDescriptor;
use crate::command::{CommandCode, ConfigDirection};
use crate::config::EffectConfig;
use crate::descriptor::EffectDescriptor;
use crate::error::EffectResult;
use crate::remote::TransportError;
use crate::status_queue::StatusQueueDescriptor;

/// Calls issued by the client to the broker process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EffectRequest {
    Hello,
    PrepareForProcessing,
    SetProcessBuffers {
        input: EffectBufferDescriptor,
        output: EffectBufferDescriptor,
    },
    GetDescriptor,
    Command {
        code: CommandCode,
        data: Vec<u8>,
        reply_capacity: u32,
    },
    GetConfig {
        direction: ConfigDirection,
    },
    SetConfig {
        direction: ConfigDirection,
        config: EffectConfig,
    },
    Close,
    Debug,
    Ping,
    Shutdown,
}

/// Replies from the broker, one per request except `Shutdown`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EffectReply {
    Acknowledge,
    Prepared {
        result: EffectResult,
        status_queue: Option<StatusQueueDescriptor>,
    },
    Result(EffectResult),
    Descriptor {
        result: EffectResult,
        descriptor: Option<EffectDescriptor>,
    },
    Command {
        status: i32,
        data: Vec<u8>,
    },
    Config {
        result: EffectResult,
        config: Option<EffectConfig>,
    },
    Dump(String),
    Pong,
}

/// Bidirectional transport over a pair of byte streams, typically pipes.
#[derive(Debug)]
pub struct IpcTransport<R, W>
where
    R: Read + 'static,
    W: Write + 'static,
{
    reader: Arc<parking_lot::Mutex<BufReader<R>>>,
    writer: Arc<parking_lot::Mutex<BufWriter<W>>>,
}

impl<R, W> Clone for IpcTransport<R, W>
where
    R: Read + 'static,
    W: Write + 'static,
{
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<R, W> IpcTransport<R, W>
where
    R: Read + 'static,
    W: Write + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Arc::new(parking_lot::Mutex::new(BufReader::new(reader))),
            writer: Arc::new(parking_lot::Mutex::new(BufWriter::new(writer))),
        }
    }

    pub fn send<T: Serialize>(&self, value: &T) -> Result<(), TransportError> {
        let mut writer = self.writer.lock();
        bincode::serialize_into(&mut *writer, value).map_err(classify)?;
        writer.flush().map_err(classify_io)?;
        Ok(())
    }

    pub fn recv<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        let mut reader = self.reader.lock();
        bincode::deserialize_from(&mut *reader).map_err(classify)
    }

    /// Sends `request` and waits for the reply to it.
    pub fn call<Req: Serialize, Rep: DeserializeOwned>(
        &self,
        request: &Req,
    ) -> Result<Rep, TransportError> {
        self.send(request)?;
        self.recv()
    }
}

fn classify(err: bincode::Error) -> TransportError {
    match *err {
        bincode::ErrorKind::Io(io) => classify_io(io),
        other => TransportError::Codec(Box::new(other)),
    }
}

fn classify_io(err: std::io::Error) -> TransportError {
    match err.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe => TransportError::Disconnected,
        _ => TransportError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn requests_survive_the_wire() {
        let request = EffectRequest::Command {
            code: CommandCode::GET_PARAM,
            data: vec![1, 2, 3],
            reply_capacity: 8,
        };
        let bytes = bincode::serialize(&request).unwrap();
        let transport = IpcTransport::new(Cursor::new(bytes), Vec::new());
        let decoded: EffectRequest = transport.recv().unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn closed_stream_reads_as_disconnected() {
        let transport = IpcTransport::new(Cursor::new(Vec::new()), Vec::new());
        let err = transport.recv::<EffectReply>().unwrap_err();
        assert!(matches!(err, TransportError::Disconnected), "{err:?}");
    }
}
