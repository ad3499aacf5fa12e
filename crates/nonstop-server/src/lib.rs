//! The nonstop daemon core: request protocol, command handlers, scheduler
//! event handling, callbacks, persistence and the client library.

pub mod auth;
pub mod client;
mod commands;
pub mod events;
pub mod notifier;
pub mod persist;
pub mod protocol;
pub mod server;
pub mod service;
pub mod wire;

pub use auth::{AuthError, Credential, HmacSealer, Sealer};
pub use client::{Client, ClientError, receive_event};
pub use notifier::{StateTask, StateTaskConfig};
pub use persist::{Saver, restore};
pub use protocol::{Command, ErrorCode, ProtocolError, Reply, VERSION};
pub use server::Server;
pub use service::Nonstop;
pub use wire::WireError;
