//! Database Module
//!
//! The execution contract the persistence layer replays into, and the
//! connection surface commands run against.
//!
//! ## Responsibilities
//! - `Database`: execute one command line for one connection
//! - `Dump`: re-express a database's contents as command lines (AOF rewrite)
//! - `Connection`: what a command may do to its client (reply, switch database)
//! - `FakeConnection`: replay stand-in that only tracks the selected database

mod standalone;

pub use standalone::StandaloneDatabase;

use crate::error::Result;
use crate::protocol::{CmdLine, Reply};

/// A client as seen by command execution
pub trait Connection {
    /// Send raw bytes to the client
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Currently selected database index
    fn db_index(&self) -> usize;

    /// Switch the selected database
    fn select_db(&mut self, index: usize);
}

/// Command execution interface
///
/// Failures are reported as `Reply::Error` values, never by unwinding.
pub trait Database: Send + Sync {
    fn exec(&self, conn: &mut dyn Connection, args: &[Vec<u8>]) -> Reply;

    fn close(&self);

    fn after_client_close(&self, conn: &dyn Connection);
}

/// A database whose contents can be rebuilt from a stream of commands
pub trait Dump: Database {
    /// Number of logical databases
    fn database_count(&self) -> usize;

    /// Feed commands that recreate database `db_index` to `visitor` until it returns `false`
    fn dump_db(&self, db_index: usize, visitor: &mut dyn FnMut(CmdLine) -> bool);
}

/// Connection used while replaying the AOF; replies go nowhere
#[derive(Debug, Default, Clone)]
pub struct FakeConnection {
    db_index: usize,
}

impl FakeConnection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connection for FakeConnection {
    fn write(&mut self, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    fn db_index(&self) -> usize {
        self.db_index
    }

    fn select_db(&mut self, index: usize) {
        self.db_index = index;
    }
}
