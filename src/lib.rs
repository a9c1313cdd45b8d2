#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

pub mod client;
pub mod codec;
pub mod error;
pub mod id_allocator;
pub mod protocol;
pub mod request_id;
pub mod server;

pub use crate::client::ClientInterface;
pub use crate::client::event::{Event, FcgiRequest, FcgiResponse};
pub use crate::error::{ClientError, ClientResult, ServerConfigError, ServerConfigResult};
pub use crate::request_id::RequestId;
