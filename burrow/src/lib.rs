#![cfg_attr(not(doctest), doc = include_str!("../README.md"))]

pub mod codec;
pub mod config;
pub mod control;
pub mod error;
mod handshake;
pub mod hooks;
pub mod message;
pub mod pipe;
mod pool;
pub mod registry;
pub mod server;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{EncryptMode, ServerConfig, Tunables};
pub use control::Control;
pub use error::{BoxError, Error, Result};
pub use hooks::{Auth, Cipher, Hooks, Notify};
pub use message::{ClientId, CtlMsg, Protocol, TunnelConfig};
pub use pipe::{BoxPipeIo, MakePipeSession, PipeIo, PipeSession};
pub use registry::{Registry, TunnelEntry};
pub use server::Server;
pub use tunnel::serve_stream;
