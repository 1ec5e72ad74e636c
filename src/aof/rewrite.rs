//! AOF rewrite
//!
//! Compacts the AOF online in three phases:
//! ```text
//!   start  ── lock ── fsync, note size + current db, create temp file ── unlock
//!   do     ── no lock ── replay [0, size) into a scratch db, dump it to temp
//!   finish ── lock ── copy [size, eof) to temp, rename over the AOF ── unlock
//! ```
//! Appends keep landing in the live file during `do`; `finish` carries them over.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use crate::database::Dump;
use crate::error::{EmberError, Result};
use crate::protocol::encode_command;

use super::handler::{open_append, AofHandler};
use super::record::select_cmd;

/// State carried from `start_rewrite` to `finish_rewrite`.
///
/// Dropping it before `finish_rewrite` deletes the temp file.
pub struct RewriteContext {
    tmp_file: NamedTempFile,
    file_size: u64,
    db_index: Option<usize>,
}

impl RewriteContext {
    pub fn tmp_path(&self) -> &Path {
        self.tmp_file.path()
    }

    /// AOF length when the rewrite started
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Database the AOF was positioned in when the rewrite started
    pub fn db_index(&self) -> Option<usize> {
        self.db_index
    }
}

impl AofHandler {
    /// Compact the AOF while appends continue.
    ///
    /// On failure the temp file is removed and the live AOF is left as it was.
    pub fn rewrite(&self) -> Result<()> {
        let Some(_running) = self.rewriting.try_lock() else {
            return Err(EmberError::Rewrite("a rewrite is already in progress".to_string()));
        };

        let result = self.start_rewrite().and_then(|mut ctx| {
            self.do_rewrite(&mut ctx)?;
            self.finish_rewrite(ctx)
        });
        if let Err(err) = &result {
            error!(error = %err, "AOF rewrite failed, keeping the current file");
        }
        result
    }

    /// Checkpoint the AOF and create the temp file
    pub fn start_rewrite(&self) -> Result<RewriteContext> {
        let state = self.shared.state.lock();
        state.file.sync_all()?;
        let file_size = state.file.metadata()?.len();

        let tmp_file = tempfile::Builder::new()
            .prefix(".emberkv-rewrite-")
            .suffix(".aof")
            .tempfile_in(&self.tmp_dir)
            .map_err(|e| {
                EmberError::Rewrite(format!(
                    "cannot create temp file in {}: {}",
                    self.tmp_dir.display(),
                    e
                ))
            })?;

        debug!(
            file_size,
            tmp = %tmp_file.path().display(),
            "AOF rewrite started"
        );
        Ok(RewriteContext {
            tmp_file,
            file_size,
            db_index: state.current_db,
        })
    }

    /// Write the compacted checkpoint state into the temp file
    pub fn do_rewrite(&self, ctx: &mut RewriteContext) -> Result<()> {
        let tmp_db = (self.tmp_db_maker)();
        let stats = self.replay(&*tmp_db, Some(ctx.file_size))?.stats;

        let mut writer = BufWriter::new(ctx.tmp_file.as_file_mut());
        let written = if self.use_snapshot_preamble {
            self.preamble.encode(&*tmp_db, &mut writer)?
        } else {
            write_commands(&*tmp_db, &mut writer)?
        };
        writer.flush()?;
        drop(writer);
        tmp_db.close();

        debug!(
            replayed = stats.commands_replayed,
            bytes = written,
            preamble = self.use_snapshot_preamble,
            "AOF rewrite body written"
        );
        Ok(())
    }

    /// Append the tail written since `start_rewrite` and swap the temp file in
    pub fn finish_rewrite(&self, mut ctx: RewriteContext) -> Result<()> {
        let mut state = self.shared.state.lock();

        let mut live = File::open(&self.shared.filename)?;
        live.seek(SeekFrom::Start(ctx.file_size))?;

        let tmp = ctx.tmp_file.as_file_mut();
        if let Some(db_index) = ctx.db_index {
            tmp.write_all(&encode_command(&select_cmd(db_index)))?;
        }
        let tail = io::copy(&mut live, tmp)?;

        // The tail may end in another database; reposition so the tracked index is exact
        if let Some(db_index) = ctx.db_index {
            if state.current_db != ctx.db_index {
                tmp.write_all(&encode_command(&select_cmd(db_index)))?;
            }
        }
        tmp.sync_all()?;

        let file = open_append(ctx.tmp_file.path())?;
        ctx.tmp_file.persist(&self.shared.filename).map_err(|e| {
            EmberError::Rewrite(format!(
                "cannot replace {}: {}",
                self.shared.filename.display(),
                e
            ))
        })?;

        state.file = file;
        state.current_db = ctx.db_index;

        info!(
            path = %self.shared.filename.display(),
            previous_size = ctx.file_size,
            tail_bytes = tail,
            "AOF rewrite finished"
        );
        Ok(())
    }
}

/// Dump every database as `SELECT` followed by its commands
fn write_commands(db: &dyn Dump, writer: &mut dyn Write) -> Result<u64> {
    let mut written = 0u64;
    let mut failure: Option<io::Error> = None;

    for db_index in 0..db.database_count() {
        let mut selected = false;
        db.dump_db(db_index, &mut |args| {
            if !selected {
                let select = encode_command(&select_cmd(db_index));
                if let Err(err) = writer.write_all(&select) {
                    failure = Some(err);
                    return false;
                }
                written += select.len() as u64;
                selected = true;
            }
            let command = encode_command(&args);
            if let Err(err) = writer.write_all(&command) {
                failure = Some(err);
                return false;
            }
            written += command.len() as u64;
            true
        });

        if let Some(err) = failure.take() {
            return Err(err.into());
        }
    }

    Ok(written)
}
