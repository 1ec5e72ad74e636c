//! Reply definitions
//!
//! Every value the server can put on the wire, plus the shared constants.

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};

use super::{CmdLine, CRLF};

/// A RESP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Binary-safe string; `None` is the null bulk
    Bulk(Option<Vec<u8>>),

    /// Array of binary-safe strings; commands take this shape
    MultiBulk(Vec<Option<Vec<u8>>>),

    /// Simple status such as `OK`
    Status(Cow<'static, str>),

    /// Signed 64-bit integer
    Integer(i64),

    /// Error message, sent with a leading `-`
    Error(Cow<'static, str>),

    /// Array of arbitrary nested replies
    MultiRaw(Vec<Reply>),

    /// Nothing is written to the client
    NoReply,
}

impl Reply {
    pub const OK: Reply = Reply::Status(Cow::Borrowed("OK"));
    pub const PONG: Reply = Reply::Status(Cow::Borrowed("PONG"));
    pub const NULL_BULK: Reply = Reply::Bulk(None);
    pub const EMPTY_MULTI_BULK: Reply = Reply::MultiBulk(Vec::new());
    pub const NO_REPLY: Reply = Reply::NoReply;

    pub const UNKNOWN_ERR: Reply = Reply::Error(Cow::Borrowed("ERR unknown"));
    pub const SYNTAX_ERR: Reply = Reply::Error(Cow::Borrowed("ERR syntax error"));
    pub const WRONG_TYPE_ERR: Reply = Reply::Error(Cow::Borrowed(
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    ));

    pub fn bulk(arg: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(Some(arg.into()))
    }

    /// Wrap a command line as a MultiBulk with no null arguments
    pub fn multi_bulk(args: CmdLine) -> Self {
        Reply::MultiBulk(args.into_iter().map(Some).collect())
    }

    pub fn status(text: impl Into<Cow<'static, str>>) -> Self {
        Reply::Status(text.into())
    }

    pub fn integer(value: i64) -> Self {
        Reply::Integer(value)
    }

    pub fn error(message: impl Into<Cow<'static, str>>) -> Self {
        Reply::Error(message.into())
    }

    /// Wrong number of arguments for `cmd`
    pub fn arg_num_error(cmd: &str) -> Self {
        Reply::Error(format!("ERR wrong number of arguments for '{}' command", cmd).into())
    }

    /// Unexpected bytes met while decoding a request
    pub fn protocol_error(message: &str) -> Self {
        Reply::Error(format!("ERR Protocol error: '{}'", message).into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(status) if &**status == "OK")
    }

    /// Turn a decoded MultiBulk into a command line; null arguments become empty
    pub fn into_cmd_line(self) -> Option<CmdLine> {
        match self {
            Reply::MultiBulk(args) => Some(args.into_iter().map(Option::unwrap_or_default).collect()),
            _ => None,
        }
    }

    /// Encode to wire bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Append the wire encoding to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Reply::Bulk(None) => put_null_bulk(buf),
            Reply::Bulk(Some(arg)) if arg.is_empty() => put_null_bulk(buf),
            Reply::Bulk(Some(arg)) => put_bulk(buf, arg),
            Reply::MultiBulk(args) => {
                put_header(buf, b'*', args.len() as i64);
                for arg in args {
                    match arg {
                        Some(arg) => put_bulk(buf, arg),
                        None => put_null_bulk(buf),
                    }
                }
            }
            Reply::Status(text) => put_line(buf, b'+', text.as_bytes()),
            Reply::Integer(value) => put_header(buf, b':', *value),
            Reply::Error(message) => put_line(buf, b'-', message.as_bytes()),
            Reply::MultiRaw(replies) => {
                put_header(buf, b'*', replies.len() as i64);
                for reply in replies {
                    reply.encode(buf);
                }
            }
            Reply::NoReply => {}
        }
    }
}

pub(super) fn put_header(buf: &mut BytesMut, prefix: u8, value: i64) {
    buf.put_u8(prefix);
    buf.put_slice(value.to_string().as_bytes());
    buf.put_slice(CRLF);
}

pub(super) fn put_bulk(buf: &mut BytesMut, arg: &[u8]) {
    put_header(buf, b'$', arg.len() as i64);
    buf.put_slice(arg);
    buf.put_slice(CRLF);
}

fn put_null_bulk(buf: &mut BytesMut) {
    buf.put_slice(b"$-1\r\n");
}

fn put_line(buf: &mut BytesMut, prefix: u8, text: &[u8]) {
    buf.put_u8(prefix);
    buf.put_slice(text);
    buf.put_slice(CRLF);
}
