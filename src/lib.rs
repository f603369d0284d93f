pub mod codec;
pub mod config;
pub mod connection;
pub mod frame;
pub mod handler;
pub mod server;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
pub use config::Config;
pub use connection::Connection;
pub use frame::Frame;
pub use handler::{ConnContext, EchoHandler, Handler, HandlerError};
pub use server::{Listener, Server, ServerError, Transport};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
