//! Connection Handler
//!
//! Handles individual client connections.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::database::{Connection, Database};
use crate::engine::Engine;
use crate::error::{EmberError, Result};
use crate::protocol::{write_reply, Parser, Reply};

/// The client side of a connection as commands see it
pub struct ClientConnection {
    writer: BufWriter<TcpStream>,
    db_index: usize,
}

impl Connection for ClientConnection {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    fn db_index(&self) -> usize {
        self.db_index
    }

    fn select_db(&mut self, index: usize) {
        self.db_index = index;
    }
}

/// Handles a single client connection
pub struct ConnectionHandler {
    /// Request decoder over the read half
    parser: Parser<BufReader<TcpStream>>,

    /// Write half plus per-client state
    client: ClientConnection,

    engine: Arc<Engine>,

    /// Peer address for logging
    peer_addr: String,
}

impl ConnectionHandler {
    /// Create a new connection handler
    ///
    /// Sets up buffered I/O on two handles of the same socket
    pub fn new(stream: TcpStream, engine: Arc<Engine>) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let read_stream = stream.try_clone()?;

        Ok(Self {
            parser: Parser::new(BufReader::new(read_stream)),
            client: ClientConnection {
                writer: BufWriter::new(stream),
                db_index: 0,
            },
            engine,
            peer_addr,
        })
    }

    /// Configure connection timeouts (0 leaves a direction unbounded)
    pub fn set_timeouts(&mut self, read_ms: u64, write_ms: u64) -> Result<()> {
        if read_ms > 0 {
            self.parser
                .get_ref()
                .get_ref()
                .set_read_timeout(Some(Duration::from_millis(read_ms)))?;
        }
        if write_ms > 0 {
            self.client
                .writer
                .get_ref()
                .set_write_timeout(Some(Duration::from_millis(write_ms)))?;
        }
        Ok(())
    }

    /// Serve requests until the client goes away
    pub fn handle(&mut self) -> Result<()> {
        debug!(peer = %self.peer_addr, "connection established");
        let result = self.serve();
        self.engine.database().after_client_close(&self.client);
        result
    }

    fn serve(&mut self) -> Result<()> {
        while let Some(payload) = self.parser.next() {
            let reply = match payload {
                Ok(request) => self.dispatch(request),
                Err(EmberError::Protocol(message)) => {
                    debug!(peer = %self.peer_addr, error = %message, "bad request");
                    Reply::protocol_error(&message)
                }
                Err(EmberError::Io(err)) if is_disconnect(&err) => {
                    debug!(peer = %self.peer_addr, error = %err, "client disconnected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(peer = %self.peer_addr, error = %err, "read failed");
                    return Err(err);
                }
            };

            if let Err(err) = write_reply(&mut self.client.writer, &reply) {
                if let EmberError::Io(io_err) = &err {
                    if is_disconnect(io_err) {
                        debug!(peer = %self.peer_addr, "client left before the reply was sent");
                        return Ok(());
                    }
                }
                warn!(peer = %self.peer_addr, error = %err, "write failed");
                return Err(err);
            }
        }

        debug!(peer = %self.peer_addr, "client closed the connection");
        Ok(())
    }

    fn dispatch(&mut self, request: Reply) -> Reply {
        match request.into_cmd_line() {
            Some(args) if args.is_empty() => Reply::NO_REPLY,
            Some(args) => {
                trace!(
                    peer = %self.peer_addr,
                    command = %String::from_utf8_lossy(&args[0]),
                    "request"
                );
                self.engine.exec(&mut self.client, &args)
            }
            None => Reply::protocol_error("expected a multi-bulk request"),
        }
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}

/// Error kinds that mean the peer is gone or idle past its timeout
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
