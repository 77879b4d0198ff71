use std::io::{stdin, stdout, Read, Write};

use anyhow::Result;
use clap::Parser;
use harmoniq_effect_hal::ipc::{EffectReply, EffectRequest, IpcTransport};
use harmoniq_effect_hal::{EffectResult, EffectServer, GainProcessor, TransportError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Hosts one gain effect and serves it over stdin/stdout.
#[derive(Debug, Parser)]
#[command(name = "harmoniq-effect-broker", version)]
struct Args {
    /// Linear gain applied by the effect.
    #[arg(long, default_value_t = 1.0)]
    gain: f32,

    /// Effect name reported in its descriptor.
    #[arg(long)]
    name: Option<String>,
}

fn main() -> Result<()> {
    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut processor = GainProcessor::new(args.gain);
    if let Some(name) = args.name {
        processor = processor.with_name(name);
    }
    let mut server = EffectServer::new(processor);
    let transport = IpcTransport::new(stdin().lock(), stdout().lock());
    info!(gain = args.gain, "effect broker ready");

    loop {
        let request: EffectRequest = match transport.recv() {
            Ok(request) => request,
            Err(TransportError::Disconnected) => {
                debug!("client went away");
                break;
            }
            Err(err) => return Err(err.into()),
        };
        let Some(reply) = handle_request(&mut server, request) else {
            break;
        };
        send_reply(&transport, &reply)?;
    }

    if !server.is_closed() {
        server.close();
    }
    info!("effect broker exiting");
    Ok(())
}

fn send_reply<R, W>(transport: &IpcTransport<R, W>, reply: &EffectReply) -> Result<()>
where
    R: Read + 'static,
    W: Write + 'static,
{
    transport.send(reply)?;
    Ok(())
}

fn handle_request(server: &mut EffectServer, request: EffectRequest) -> Option<EffectReply> {
    let reply = match request {
        EffectRequest::Hello => EffectReply::Acknowledge,
        EffectRequest::PrepareForProcessing => {
            let (result, status_queue) = server.prepare_for_processing();
            EffectReply::Prepared {
                result,
                status_queue,
            }
        }
        EffectRequest::SetProcessBuffers { input, output } => {
            EffectReply::Result(server.set_process_buffers(&input, &output))
        }
        EffectRequest::GetDescriptor => EffectReply::Descriptor {
            result: EffectResult::Ok,
            descriptor: Some(server.get_descriptor()),
        },
        EffectRequest::Command {
            code,
            data,
            reply_capacity,
        } => {
            let (status, data) = server.command(code, &data, reply_capacity);
            EffectReply::Command { status, data }
        }
        EffectRequest::GetConfig { direction } => EffectReply::Config {
            result: EffectResult::Ok,
            config: Some(server.get_config(direction)),
        },
        EffectRequest::SetConfig { direction, config } => {
            EffectReply::Result(server.set_config(direction, &config))
        }
        EffectRequest::Close => EffectReply::Result(server.close()),
        EffectRequest::Debug => {
            let mut dump = Vec::new();
            if let Err(err) = server.debug(&mut dump) {
                warn!(%err, "failed to render effect dump");
            }
            EffectReply::Dump(String::from_utf8_lossy(&dump).into_owned())
        }
        EffectRequest::Ping => EffectReply::Pong,
        EffectRequest::Shutdown => return None,
    };
    Some(reply)
}
