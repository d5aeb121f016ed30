//! # xrpc
//!
//! A compact RPC framework: clients resolve a live service instance
//! through a coordination registry, frame the call on a TCP connection
//! with an optional zlib-compressed payload, and observe success, a typed
//! error, or cancellation through a per-call controller.
//!
//! ## Components
//!
//! - [codec] / [proto]: the wire codec framing `(header, payload)` pairs
//!   as `varint32(header_len) || header || payload`
//! - [net]: the async byte transport, one event-loop thread per instance
//! - [registry]: caching, watchable client over a hierarchical
//!   coordination service ([registry::Coordination]); ships an in-process
//!   backend ([registry::MemCoord])
//! - [controller]: per-call failure and cancellation state
//! - [channel]: the client call engine, synchronous and asynchronous
//! - [server]: the dispatcher routing framed requests to [service::Service]
//!   objects
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use xrpc::{MemCoord, MethodDesc, XrpcChannel, XrpcController};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct LoginRequest { username: String, password: String }
//! #[derive(Serialize, Deserialize, Default)]
//! struct LoginResponse { success: bool, token: String }
//!
//! const LOGIN: MethodDesc = MethodDesc::new("UserService", "Login");
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coord = MemCoord::new();
//!     let channel = XrpcChannel::new("configs/xrpc.conf", coord.session())?;
//!     let controller = XrpcController::new();
//!     let request = LoginRequest { username: "u".into(), password: "p".into() };
//!     let mut response = LoginResponse::default();
//!     channel.call(&LOGIN, &controller, &request, &mut response);
//!     if controller.failed() {
//!         eprintln!("login failed: {}", controller.error_text());
//!     }
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod logger;
pub mod net;
pub mod proto;
pub mod registry;
pub mod server;
pub mod service;

pub use channel::{CallDone, XrpcChannel};
pub use config::XrpcConfig;
pub use controller::XrpcController;
pub use error::{CodecError, CoordError, WireErr, XrpcError};
pub use proto::RpcHeader;
pub use registry::{Coordination, MemCoord, MemSession, RegistryClient};
pub use server::XrpcServer;
pub use service::{MethodDesc, Message, Service, ServiceDesc};
