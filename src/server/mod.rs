//! Server module - Unix socket listener and client connection handling

mod connection;
mod listener;

pub use connection::{client_writer_task, handle_client, ClientConnection};
pub use listener::ServerListener;
