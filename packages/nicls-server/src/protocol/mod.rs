//! Line-delimited JSON control protocol spoken with the task process.

mod connection;
mod message;
mod server;

pub use connection::{ServerContext, TaskConnection};
pub use message::{read_line, MessageType, ProtocolError, TaskMessage, MAX_LINE_BYTES};
pub use server::TaskServer;
