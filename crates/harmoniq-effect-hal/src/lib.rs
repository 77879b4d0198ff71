//! Harmoniq Studio out-of-process effect hosting.
//!
//! Effects run inside a helper process (or a dedicated worker) while the audio
//! pipeline drives them through an [`EffectSession`]. Audio samples never travel
//! over the IPC transport: both sides map the same shared buffers, the client
//! raises a request bit on an [`EventFlag`] word, and the server answers with a
//! single status code through a [`StatusQueue`] before raising the completion
//! bit. Buffer descriptors are only re-sent when the bound regions or their
//! frame counts change, so the steady state costs one wake and one wait per
//! audio block.

pub mod binding;
pub mod broker;
pub mod buffer;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod event_flag;
pub mod ipc;
pub mod remote;
pub mod server;
pub mod session;
pub mod shm;
pub mod status_queue;

pub use binding::BufferBindingTracker;
pub use broker::{BrokerConfig, EffectBroker};
pub use buffer::{EffectBuffer, EffectBufferDescriptor};
pub use command::{CommandCode, CommandRoute, ConfigDirection};
pub use config::{EffectBufferConfig, EffectConfig, LegacyEffectConfig, LEGACY_CONFIG_SIZE};
pub use descriptor::{EffectDescriptor, EffectFlags};
pub use error::{analyze_result, EffectResult, HalError, Status};
pub use event_flag::{EventFlag, WaitError};
pub use remote::{RemoteEffect, TransportError};
pub use server::{EffectProcessor, EffectServer, GainProcessor, LocalEffect, ProcessBlock};
pub use session::{EffectSession, SessionOptions, SessionStats, SharedEffectSession, WaitPolicy};
pub use status_queue::{StatusQueue, StatusQueueDescriptor};
