use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, warn};

use crate::buffer::EffectBufferDescriptor;
use crate::command::{CommandCode, ConfigDirection};
use crate::config::EffectConfig;
use crate::descriptor::EffectDescriptor;
use crate::error::EffectResult;
use crate::ipc::{EffectReply, EffectRequest, IpcTransport};
use crate::remote::{RemoteEffect, TransportError};
use crate::status_queue::StatusQueueDescriptor;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub executable: PathBuf,
    /// Gain applied by the hosted effect.
    pub gain: f32,
    pub name: Option<String>,
    pub handshake_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            executable: std::env::var_os("HARMONIQ_EFFECT_BROKER")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("harmoniq-effect-broker")),
            gain: 1.0,
            name: None,
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

/// Effect hosted in a helper process, reached over its stdin/stdout.
#[derive(Debug)]
pub struct EffectBroker {
    child: Child,
    client: IpcTransport<ChildStdout, ChildStdin>,
    shut_down: bool,
}

impl EffectBroker {
    pub fn spawn(config: BrokerConfig) -> Result<Self> {
        let mut command = Command::new(&config.executable);
        command
            .arg("--gain")
            .arg(config.gain.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(name) = &config.name {
            command.arg("--name").arg(name);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn effect broker at {:?}", config.executable))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("broker stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("broker stdin not captured"))?;
        let client = IpcTransport::new(stdout, stdin);

        debug!(
            "waiting for effect broker handshake (timeout {:?})",
            config.handshake_timeout
        );
        if let Err(err) = handshake(&client, config.handshake_timeout) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }

        Ok(Self {
            child,
            client,
            shut_down: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let _ = self.client.send(&EffectRequest::Shutdown);
        match self.child.wait() {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(anyhow!("effect broker exited with status {:?}", status)),
            Err(err) => Err(err.into()),
        }
    }

    fn call(&self, request: &EffectRequest) -> Result<EffectReply, TransportError> {
        if self.shut_down {
            return Err(TransportError::Disconnected);
        }
        self.client.call(request)
    }

    fn call_result(&self, request: &EffectRequest) -> Result<EffectResult, TransportError> {
        match self.call(request)? {
            EffectReply::Result(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }
}

fn handshake(client: &IpcTransport<ChildStdout, ChildStdin>, timeout: Duration) -> Result<()> {
    client.send(&EffectRequest::Hello)?;
    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    let reader = client.clone();
    thread::spawn(move || {
        let _ = reply_tx.send(reader.recv::<EffectReply>());
    });
    match reply_rx.recv_timeout(timeout) {
        Ok(Ok(EffectReply::Acknowledge)) => {
            debug!("effect broker acknowledged");
            Ok(())
        }
        Ok(Ok(other)) => Err(anyhow!("unexpected broker response: {:?}", other)),
        Ok(Err(err)) => Err(err).context("effect broker handshake failed"),
        Err(RecvTimeoutError::Timeout) => Err(anyhow!("effect broker handshake timed out")),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("effect broker handshake aborted")),
    }
}

fn unexpected(reply: EffectReply) -> TransportError {
    TransportError::Protocol(format!("{reply:?}"))
}

impl RemoteEffect for EffectBroker {
    fn prepare_for_processing(
        &mut self,
    ) -> Result<(EffectResult, Option<StatusQueueDescriptor>), TransportError> {
        match self.call(&EffectRequest::PrepareForProcessing)? {
            EffectReply::Prepared {
                result,
                status_queue,
            } => Ok((result, status_queue)),
            other => Err(unexpected(other)),
        }
    }

    fn set_process_buffers(
        &mut self,
        input: &EffectBufferDescriptor,
        output: &EffectBufferDescriptor,
    ) -> Result<EffectResult, TransportError> {
        self.call_result(&EffectRequest::SetProcessBuffers {
            input: input.clone(),
            output: output.clone(),
        })
    }

    fn get_descriptor(&mut self) -> Result<(EffectResult, Option<EffectDescriptor>), TransportError> {
        match self.call(&EffectRequest::GetDescriptor)? {
            EffectReply::Descriptor { result, descriptor } => Ok((result, descriptor)),
            other => Err(unexpected(other)),
        }
    }

    fn command(
        &mut self,
        code: CommandCode,
        data: &[u8],
        reply_capacity: u32,
    ) -> Result<(i32, Vec<u8>), TransportError> {
        let request = EffectRequest::Command {
            code,
            data: data.to_vec(),
            reply_capacity,
        };
        match self.call(&request)? {
            EffectReply::Command { status, data } => Ok((status, data)),
            other => Err(unexpected(other)),
        }
    }

    fn get_config(
        &mut self,
        direction: ConfigDirection,
    ) -> Result<(EffectResult, Option<EffectConfig>), TransportError> {
        match self.call(&EffectRequest::GetConfig { direction })? {
            EffectReply::Config { result, config } => Ok((result, config)),
            other => Err(unexpected(other)),
        }
    }

    fn set_config(
        &mut self,
        direction: ConfigDirection,
        config: &EffectConfig,
    ) -> Result<EffectResult, TransportError> {
        self.call_result(&EffectRequest::SetConfig {
            direction,
            config: *config,
        })
    }

    fn close(&mut self) -> Result<EffectResult, TransportError> {
        self.call_result(&EffectRequest::Close)
    }

    fn debug(&mut self, out: &mut dyn Write) -> Result<(), TransportError> {
        match self.call(&EffectRequest::Debug)? {
            EffectReply::Dump(text) => {
                out.write_all(text.as_bytes())?;
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    fn ping(&mut self) -> Result<(), TransportError> {
        match self.call(&EffectRequest::Ping)? {
            EffectReply::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for EffectBroker {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(?err, "effect broker did not shut down cleanly");
        }
    }
}
