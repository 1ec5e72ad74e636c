//! AOF recovery
//!
//! Rebuilds database state by replaying the AOF through the protocol parser.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::database::{Connection, Database, FakeConnection};
use crate::error::{EmberError, Result};
use crate::protocol::{parse_stream, CmdLine, Reply};

use super::handler::AofHandler;

/// Outcome of a replay
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    /// Commands handed to the database, preamble entries included
    pub commands_replayed: u64,

    /// Payloads that could not be decoded or were not commands
    pub payloads_skipped: u64,

    /// Commands the database answered with an error
    pub exec_errors: u64,

    /// Size of the snapshot preamble, 0 if there was none
    pub preamble_bytes: u64,

    /// Bytes of a partial final command cut from the end of the file
    pub truncated_bytes: u64,
}

/// What a replay pass saw, beyond the counts
pub(super) struct Replayed {
    pub(super) stats: ReplayStats,

    /// Database selected at the end of the stream
    pub(super) final_db: usize,

    /// Offset just past the last complete payload, set when the file ends
    /// with a partial command
    pub(super) partial_tail_at: Option<u64>,
}

/// Clears the append flag for its lifetime and restores it on drop
struct AppendPause<'a> {
    flag: &'a AtomicBool,
    previous: bool,
}

impl<'a> AppendPause<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        let previous = flag.swap(false, Ordering::AcqRel);
        Self { flag, previous }
    }
}

impl Drop for AppendPause<'_> {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::Release);
    }
}

impl AofHandler {
    /// Replay the AOF into `db`.
    ///
    /// Appends are suspended for the duration so replayed commands are not
    /// journaled again. `max_bytes == 0` replays the whole file; otherwise at
    /// most `max_bytes` bytes, counted from the start of the file including
    /// any snapshot preamble, are read. A missing file is an empty log.
    ///
    /// A full replay that ends in a partial command truncates the file back
    /// to the last complete command, so later appends start on a frame
    /// boundary.
    pub fn load(&self, db: &dyn Database, max_bytes: u64) -> Result<ReplayStats> {
        let _pause = AppendPause::new(&self.enabled);
        let limit = (max_bytes > 0).then_some(max_bytes);

        let Replayed {
            mut stats,
            final_db,
            partial_tail_at,
        } = self.replay(db, limit)?;

        if limit.is_none() {
            let mut state = self.shared.state.lock();
            if let Some(valid_len) = partial_tail_at {
                let file_len = state.file.metadata()?.len();
                if file_len > valid_len {
                    state.file.set_len(valid_len)?;
                    state.file.sync_all()?;
                    stats.truncated_bytes = file_len - valid_len;
                    warn!(
                        path = %self.shared.filename.display(),
                        valid_len,
                        truncated = stats.truncated_bytes,
                        "AOF truncated to its last complete command"
                    );
                }
            }
            state.current_db = Some(final_db);
        }

        info!(
            commands = stats.commands_replayed,
            skipped = stats.payloads_skipped,
            exec_errors = stats.exec_errors,
            preamble_bytes = stats.preamble_bytes,
            "AOF loaded"
        );
        Ok(stats)
    }

    /// Replay up to `limit` bytes of the AOF into `db`
    pub(super) fn replay<D>(&self, db: &D, limit: Option<u64>) -> Result<Replayed>
    where
        D: Database + ?Sized,
    {
        let mut stats = ReplayStats::default();
        let mut conn = FakeConnection::new();

        let mut file = match File::open(&self.shared.filename) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.shared.filename.display(), "no AOF to load");
                return Ok(Replayed {
                    stats,
                    final_db: 0,
                    partial_tail_at: None,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let preamble = {
            let mut apply = |db_index: usize, args: CmdLine| {
                conn.select_db(db_index);
                apply_command(db, &mut conn, &args, &mut stats);
            };
            self.preamble.decode(&mut file, &mut apply)?
        };

        let consumed = preamble.unwrap_or(0);
        stats.preamble_bytes = consumed;
        file.seek(SeekFrom::Start(consumed))?;
        conn.select_db(0);

        let reader: Box<dyn Read> = match limit {
            Some(limit) => Box::new(file.take(limit.saturating_sub(consumed))),
            None => Box::new(file),
        };

        let mut parser = parse_stream(reader);
        let mut partial_tail_at = None;
        // Offset just past the last frame the parser finished with
        let mut frame_end = consumed;

        while let Some(payload) = parser.next() {
            let reply = match payload {
                Ok(reply) => reply,
                Err(err) if err.is_protocol() => {
                    error!(error = %err, "skipping malformed AOF payload");
                    stats.payloads_skipped += 1;
                    frame_end = consumed + parser.position();
                    continue;
                }
                Err(EmberError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(error = %err, "AOF ends with a partial command, ignoring it");
                    stats.payloads_skipped += 1;
                    partial_tail_at = Some(frame_end);
                    break;
                }
                Err(err) => return Err(err),
            };
            frame_end = consumed + parser.position();

            let args = match reply.into_cmd_line() {
                Some(args) if !args.is_empty() => args,
                _ => {
                    error!("AOF payload is not a command, skipping");
                    stats.payloads_skipped += 1;
                    continue;
                }
            };
            apply_command(db, &mut conn, &args, &mut stats);
        }

        Ok(Replayed {
            stats,
            final_db: conn.db_index(),
            partial_tail_at,
        })
    }
}

fn apply_command<D>(db: &D, conn: &mut FakeConnection, args: &[Vec<u8>], stats: &mut ReplayStats)
where
    D: Database + ?Sized,
{
    stats.commands_replayed += 1;
    if let Reply::Error(message) = db.exec(conn, args) {
        stats.exec_errors += 1;
        error!(
            error = %message,
            command = %String::from_utf8_lossy(&args[0]),
            "replayed command failed"
        );
    }
}
