//! TCP Server
//!
//! Accepts connections and serves each on its own thread.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{EmberError, Result};
use crate::protocol::{write_reply, Reply};

use super::connection::ConnectionHandler;

/// TCP server for EmberKV
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    engine: Arc<Engine>,
    max_connections: usize,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
    active: Arc<AtomicUsize>,
    shutdown: AtomicBool,
}

impl Server {
    /// Bind to `config.listen_addr`
    pub fn bind(config: &Config, engine: Arc<Engine>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).map_err(|e| {
            EmberError::Network(format!("cannot bind {}: {}", config.listen_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            engine,
            max_connections: config.max_connections,
            read_timeout_ms: config.read_timeout_ms,
            write_timeout_ms: config.write_timeout_ms,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently being served
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Accept connections until `shutdown` is called (blocking)
    pub fn run(&self) -> Result<()> {
        info!(addr = %self.local_addr, "listening");

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };

            if self.active.fetch_add(1, Ordering::AcqRel) >= self.max_connections {
                self.active.fetch_sub(1, Ordering::AcqRel);
                reject(stream);
                continue;
            }

            if let Err(err) = self.spawn_connection(stream) {
                self.active.fetch_sub(1, Ordering::AcqRel);
                error!(error = %err, "cannot start connection thread");
            }
        }

        info!(addr = %self.local_addr, "server stopped");
        Ok(())
    }

    /// Stop accepting. Connections already open run to completion.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept
        if let Err(err) = TcpStream::connect(self.local_addr) {
            debug!(error = %err, "shutdown wake-up connect failed");
        }
    }

    fn spawn_connection(&self, stream: TcpStream) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let active = Arc::clone(&self.active);
        let (read_ms, write_ms) = (self.read_timeout_ms, self.write_timeout_ms);

        thread::Builder::new()
            .name("emberkv-conn".to_string())
            .spawn(move || {
                let result = ConnectionHandler::new(stream, engine).and_then(|mut handler| {
                    handler.set_timeouts(read_ms, write_ms)?;
                    handler.handle()
                });
                if let Err(err) = result {
                    debug!(error = %err, "connection ended with error");
                }
                active.fetch_sub(1, Ordering::AcqRel);
            })?;
        Ok(())
    }
}

fn reject(mut stream: TcpStream) {
    warn!("max connections reached, rejecting client");
    let reply = Reply::error("ERR max number of clients reached");
    if let Err(err) = write_reply(&mut stream, &reply) {
        debug!(error = %err, "cannot send rejection");
    }
}
