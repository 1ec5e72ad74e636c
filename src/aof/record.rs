//! AOF record definitions

use crate::protocol::CmdLine;

/// One command destined for the AOF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Database the command was executed against
    pub db_index: usize,

    /// The command itself
    pub cmd_line: CmdLine,
}

/// Called back after each successful AOF write.
///
/// Runs on the writing thread with the AOF lock held; a slow listener delays
/// every later append.
pub trait AofListener: Send + Sync {
    /// `batch` holds the commands just written, SELECT marker included
    fn on_appended(&self, batch: &[CmdLine]);
}

/// `SELECT <db_index>`
pub fn select_cmd(db_index: usize) -> CmdLine {
    vec![b"SELECT".to_vec(), db_index.to_string().into_bytes()]
}
