//! Snapshot preamble
//!
//! A rewrite may begin the new AOF with a compact binary image of the
//! keyspace instead of one command per key. Replay detects it by its magic.
//!
//! ## Layout
//! ```text
//! ┌──────────────┬──────────────┬─────────────┬──────────────────────────┐
//! │ "EMBERSNP"(8)│ Len (8, LE)  │ CRC (4, LE) │ bincode Vec<Entry> (Len) │
//! └──────────────┴──────────────┴─────────────┴──────────────────────────┘
//! ```

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::database::Dump;
use crate::error::{EmberError, Result};
use crate::protocol::CmdLine;

/// Leading bytes of a snapshot preamble
pub const SNAPSHOT_MAGIC: &[u8; 8] = b"EMBERSNP";

/// Magic + length + checksum
const HEADER_SIZE: u64 = 8 + 8 + 4;

/// Encodes and decodes the block that may precede the AOF's command stream
pub trait PreambleCodec: Send + Sync {
    /// Write an image of `db`, returning the number of bytes written
    fn encode(&self, db: &dyn Dump, writer: &mut dyn Write) -> Result<u64>;

    /// Read a preamble from the start of `reader`, handing each command to `apply`.
    ///
    /// Returns the bytes consumed, or `None` when the stream does not start
    /// with a preamble.
    fn decode(
        &self,
        reader: &mut dyn Read,
        apply: &mut dyn FnMut(usize, CmdLine),
    ) -> Result<Option<u64>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    db_index: u32,
    args: CmdLine,
}

/// Default preamble: checksummed bincode list of `(db, command)` entries
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotPreamble;

impl PreambleCodec for SnapshotPreamble {
    fn encode(&self, db: &dyn Dump, writer: &mut dyn Write) -> Result<u64> {
        let mut entries = Vec::new();
        for db_index in 0..db.database_count() {
            db.dump_db(db_index, &mut |args| {
                entries.push(SnapshotEntry {
                    db_index: db_index as u32,
                    args,
                });
                true
            });
        }

        let payload =
            bincode::serialize(&entries).map_err(|e| EmberError::Serialization(e.to_string()))?;
        let checksum = crc32fast::hash(&payload);

        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&(payload.len() as u64).to_le_bytes())?;
        writer.write_all(&checksum.to_le_bytes())?;
        writer.write_all(&payload)?;

        Ok(HEADER_SIZE + payload.len() as u64)
    }

    fn decode(
        &self,
        reader: &mut dyn Read,
        apply: &mut dyn FnMut(usize, CmdLine),
    ) -> Result<Option<u64>> {
        let mut magic = [0u8; 8];
        if read_up_to(reader, &mut magic)? < magic.len() || &magic != SNAPSHOT_MAGIC {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 8];
        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).map_err(truncated)?;
        reader.read_exact(&mut crc_bytes).map_err(truncated)?;
        let len = u64::from_le_bytes(len_bytes);
        let expected = u32::from_le_bytes(crc_bytes);

        // Read through `take` so a corrupt length cannot force a huge allocation
        let mut payload = Vec::new();
        (&mut *reader).take(len).read_to_end(&mut payload)?;
        if payload.len() as u64 != len {
            return Err(EmberError::Snapshot(format!(
                "preamble truncated: expected {} payload bytes, found {}",
                len,
                payload.len()
            )));
        }

        let actual = crc32fast::hash(&payload);
        if actual != expected {
            return Err(EmberError::Snapshot(format!(
                "preamble checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            )));
        }

        let entries: Vec<SnapshotEntry> =
            bincode::deserialize(&payload).map_err(|e| EmberError::Serialization(e.to_string()))?;
        for entry in entries {
            apply(entry.db_index as usize, entry.args);
        }

        Ok(Some(HEADER_SIZE + len))
    }
}

/// Fill as much of `buf` as the stream allows
fn read_up_to(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn truncated(err: io::Error) -> EmberError {
    EmberError::Snapshot(format!("preamble header truncated: {}", err))
}
