//! Network Module
//!
//! TCP server and client handling.
//!
//! ## Architecture
//! - Single acceptor thread
//! - One thread per connection, capped at `max_connections`
//! - Requests decoded with the streaming parser, executed through Engine

mod connection;
mod server;

pub use connection::{ClientConnection, ConnectionHandler};
pub use server::Server;
