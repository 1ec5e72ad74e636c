//! AOF handler
//!
//! Owns the AOF file, the append queue and the background threads.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{Config, FsyncPolicy};
use crate::database::Dump;
use crate::error::Result;
use crate::protocol::{encode_command, CmdLine};

use super::preamble::{PreambleCodec, SnapshotPreamble};
use super::record::{select_cmd, AofListener, Record};

/// Period of the `everysec` flusher
pub const FSYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Builds an empty, AOF-less database for rewrite to rebuild state into
pub type TmpDbMaker = Box<dyn Fn() -> Box<dyn Dump> + Send + Sync>;

/// Everything guarded by the AOF lock
pub(super) struct AofState {
    pub(super) file: File,

    /// Database the file is currently positioned in; `None` until known
    pub(super) current_db: Option<usize>,

    /// Reused per-write batch handed to listeners
    buffer: Vec<CmdLine>,

    listeners: Vec<Arc<dyn AofListener>>,
}

/// State shared with the writer and ticker threads
pub(super) struct Shared {
    pub(super) filename: PathBuf,
    pub(super) policy: FsyncPolicy,
    pub(super) state: Mutex<AofState>,
}

impl Shared {
    /// Write one record. Failures are logged and the record is dropped.
    fn write_record(&self, record: Record) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.buffer.clear();

        if state.current_db != Some(record.db_index) {
            let select = select_cmd(record.db_index);
            if let Err(err) = state.file.write_all(&encode_command(&select)) {
                warn!(error = %err, db_index = record.db_index, "AOF SELECT write failed, record dropped");
                return;
            }
            state.buffer.push(select);
            state.current_db = Some(record.db_index);
        }

        if let Err(err) = state.file.write_all(&encode_command(&record.cmd_line)) {
            warn!(error = %err, db_index = record.db_index, "AOF write failed, record dropped");
            return;
        }
        state.buffer.push(record.cmd_line);

        if self.policy == FsyncPolicy::Always {
            if let Err(err) = state.file.sync_all() {
                warn!(error = %err, "AOF fsync failed");
            }
        }

        for listener in &state.listeners {
            listener.on_appended(&state.buffer);
        }
    }

    pub(super) fn fsync(&self) {
        let state = self.state.lock();
        if let Err(err) = state.file.sync_all() {
            error!(error = %err, "AOF fsync failed");
        }
    }
}

/// Append-only file handler
///
/// ## Concurrency:
/// - `shared.state`: the single AOF lock; file writes, SELECT tracking,
///   listener batches, rewrite start/finish and explicit fsync all take it
/// - queued records are written by exactly one thread, in FIFO order
/// - `enabled`: cleared while replaying so replayed commands are not re-journaled
/// - `rewriting`: serializes rewrites; appends continue while one runs
pub struct AofHandler {
    pub(super) shared: Arc<Shared>,
    pub(super) enabled: AtomicBool,
    pub(super) tmp_dir: PathBuf,
    pub(super) use_snapshot_preamble: bool,
    pub(super) preamble: Box<dyn PreambleCodec>,
    pub(super) tmp_db_maker: TmpDbMaker,

    /// Held for the whole of a rewrite; rewrites never overlap
    pub(super) rewriting: Mutex<()>,

    sender: RwLock<Option<Sender<Record>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    ticker_stop: Mutex<Option<Sender<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl AofHandler {
    /// Open (or create) the AOF named in `config` and start its background threads.
    ///
    /// Does not replay the file; call [`AofHandler::load`] before serving traffic.
    pub fn open(config: &Config, tmp_db_maker: TmpDbMaker) -> Result<Self> {
        let filename = config.append_filename.clone();
        let file = open_append(&filename)?;

        // An existing file may end in any database; force a SELECT on first write
        let current_db = if file.metadata()?.len() == 0 { Some(0) } else { None };

        let shared = Arc::new(Shared {
            filename,
            policy: config.append_fsync,
            state: Mutex::new(AofState {
                file,
                current_db,
                buffer: Vec::new(),
                listeners: Vec::new(),
            }),
        });

        let (sender, receiver) = channel::bounded(config.aof_queue_size.max(1));
        let writer = spawn_writer(Arc::clone(&shared), receiver)?;

        let (ticker_stop, ticker) = if config.append_fsync == FsyncPolicy::EverySec {
            let (stop_tx, stop_rx) = channel::bounded(0);
            let handle = spawn_ticker(Arc::clone(&shared), stop_rx)?;
            (Some(stop_tx), Some(handle))
        } else {
            (None, None)
        };

        info!(
            path = %shared.filename.display(),
            fsync = %config.append_fsync,
            "AOF opened"
        );

        Ok(Self {
            shared,
            enabled: AtomicBool::new(true),
            tmp_dir: config.rewrite_dir(),
            use_snapshot_preamble: config.use_snapshot_preamble,
            preamble: Box::new(SnapshotPreamble),
            tmp_db_maker,
            rewriting: Mutex::new(()),
            sender: RwLock::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            ticker_stop: Mutex::new(ticker_stop),
            ticker: Mutex::new(ticker),
        })
    }

    /// Replace the snapshot preamble codec
    pub fn with_preamble_codec(mut self, codec: Box<dyn PreambleCodec>) -> Self {
        self.preamble = codec;
        self
    }

    /// Journal a command executed against database `db_index`.
    ///
    /// `always` writes and fsyncs before returning. Other policies enqueue and
    /// block only while the queue is full.
    pub fn record(&self, db_index: usize, cmd_line: CmdLine) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }

        let record = Record { db_index, cmd_line };
        if self.shared.policy == FsyncPolicy::Always {
            self.shared.write_record(record);
            return;
        }

        let sender = self.sender.read();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(record).is_err() {
                    warn!("AOF writer has stopped, record dropped");
                }
            }
            None => warn!("AOF is closed, record dropped"),
        }
    }

    /// Flush the AOF to stable storage
    pub fn fsync(&self) {
        self.shared.fsync();
    }

    pub fn add_listener(&self, listener: Arc<dyn AofListener>) {
        self.shared.state.lock().listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn AofListener>) {
        self.shared
            .state
            .lock()
            .listeners
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    /// Drain the queue, stop background threads and fsync. Idempotent.
    pub fn close(&self) {
        let Some(sender) = self.sender.write().take() else {
            return;
        };
        drop(sender);

        if let Some(writer) = self.writer.lock().take() {
            if writer.join().is_err() {
                error!("AOF writer thread panicked");
            }
        }

        drop(self.ticker_stop.lock().take());
        if let Some(ticker) = self.ticker.lock().take() {
            if ticker.join().is_err() {
                error!("AOF fsync thread panicked");
            }
        }

        self.shared.fsync();
        info!(path = %self.shared.filename.display(), "AOF closed");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn filename(&self) -> &Path {
        &self.shared.filename
    }

    pub fn policy(&self) -> FsyncPolicy {
        self.shared.policy
    }

    /// Database the file is currently positioned in, if known
    pub fn current_db(&self) -> Option<usize> {
        self.shared.state.lock().current_db
    }

    /// Whether `record` currently journals anything
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl Drop for AofHandler {
    fn drop(&mut self) {
        self.close();
    }
}

pub(super) fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)
}

fn spawn_writer(shared: Arc<Shared>, receiver: Receiver<Record>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("emberkv-aof-writer".to_string())
        .spawn(move || {
            for record in receiver {
                shared.write_record(record);
            }
            debug!("AOF writer drained");
        })
}

fn spawn_ticker(shared: Arc<Shared>, stop: Receiver<()>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("emberkv-aof-fsync".to_string())
        .spawn(move || {
            let ticker = channel::tick(FSYNC_INTERVAL);
            loop {
                select! {
                    recv(ticker) -> _ => shared.fsync(),
                    recv(stop) -> _ => break,
                }
            }
            debug!("AOF fsync ticker stopped");
        })
}
