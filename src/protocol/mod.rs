//! Protocol Module
//!
//! RESP wire protocol shared by client traffic and the append-only file.
//!
//! ## Reply Shapes
//! ```text
//! Bulk        $<len>\r\n<bytes>\r\n      ($-1\r\n for null or empty)
//! MultiBulk   *<n>\r\n then n bulks      (null args as $-1\r\n)
//! Status      +<text>\r\n
//! Integer     :<n>\r\n
//! Error       -<text>\r\n
//! MultiRaw    *<n>\r\n then n nested replies, any shape
//! ```
//!
//! A command is a MultiBulk whose first argument is the command name. The
//! AOF is nothing more than a sequence of encoded commands, so the same
//! [`Parser`] serves both client connections and log replay.

mod codec;
mod command;
mod reply;

pub use codec::{
    encode_command, parse_bytes, parse_one, parse_stream, write_command, write_reply, Parser,
    MAX_BULK_LEN, MAX_MULTI_BULK_LEN,
};
pub use command::{cmd_name, to_cmd_line, CmdLine};
pub use reply::Reply;

/// Line separator of every RESP frame
pub const CRLF: &[u8] = b"\r\n";
