//! Append-Only File (AOF) Module
//!
//! Durable command journal for crash recovery.
//!
//! ## Responsibilities
//! - Journal every mutating command, with SELECT markers on database switches
//! - Apply the configured fsync policy (`always`, `everysec`, `no`)
//! - Replay the journal into a database before traffic is served
//! - Rewrite the journal online while foreground writes continue
//!
//! ## File Format
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ optional snapshot preamble (rewrite output)   │
//! ├───────────────────────────────────────────────┤
//! │ *2\r\n$6\r\nSELECT\r\n$1\r\n2\r\n             │  only when the db changes
//! │ *3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n     │
//! │ ...                                           │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Write Path
//! ```text
//!  record(db, cmd) ──always──▶ write under lock + fsync ─┐
//!        │                                               ├─▶ listeners
//!        └──everysec/no──▶ bounded queue ──▶ writer ─────┘
//! ```
//! Every byte reaching the file passes through one mutex, which is also the
//! one rewrite and explicit fsync take.

mod handler;
mod preamble;
mod record;
mod recovery;
mod rewrite;

pub use handler::{AofHandler, TmpDbMaker, FSYNC_INTERVAL};
pub use preamble::{PreambleCodec, SnapshotPreamble, SNAPSHOT_MAGIC};
pub use record::{select_cmd, AofListener, Record};
pub use recovery::ReplayStats;
pub use rewrite::RewriteContext;
