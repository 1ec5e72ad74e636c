//! Protocol codec
//!
//! Encoding helpers and the streaming request decoder.
//!
//! ## Decoder States
//! ```text
//!            ┌───────────── line ─────────────┐
//!            ▼                                │
//!   ┌────────────────┐  *n (n>0)   ┌─────────────────────┐
//!   │   top level    │────────────▶│ multi-bulk: k of n  │
//!   │ + - : $ *0     │◀────────────│ $len\r\n<len>\r\n   │
//!   └────────────────┘  k == n     └─────────────────────┘
//!            │ emits one payload per complete frame
//! ```
//!
//! A malformed frame yields an `Err` item and the decoder starts over at the
//! next line. Only I/O failures (including a stream cut off mid-frame) end the
//! sequence early; end of stream at a frame boundary simply ends it.

use std::io::{self, BufRead, BufReader, Read, Write};

use bytes::{Bytes, BytesMut};

use crate::error::{EmberError, Result};

use super::reply::{put_bulk, put_header};
use super::{Reply, CRLF};

/// Largest accepted bulk string (512 MiB)
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest accepted multi-bulk argument count
pub const MAX_MULTI_BULK_LEN: usize = 1024 * 1024;

/// Bulk buffers are reserved up front only up to this size
const BULK_PREALLOC_LIMIT: usize = 64 * 1024;

// =============================================================================
// Encoding
// =============================================================================

/// Encode a command line as a MultiBulk without copying its arguments
pub fn encode_command(args: &[Vec<u8>]) -> Bytes {
    let payload: usize = args.iter().map(|arg| arg.len() + 16).sum();
    let mut buf = BytesMut::with_capacity(16 + payload);
    put_header(&mut buf, b'*', args.len() as i64);
    for arg in args {
        put_bulk(&mut buf, arg);
    }
    buf.freeze()
}

/// Write a reply to a stream
pub fn write_reply<W: Write>(writer: &mut W, reply: &Reply) -> Result<()> {
    let bytes = reply.to_bytes();
    if bytes.is_empty() {
        return Ok(());
    }
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Write a command to a stream
pub fn write_command<W: Write>(writer: &mut W, args: &[Vec<u8>]) -> Result<()> {
    writer.write_all(&encode_command(args))?;
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode payloads lazily from any reader
pub fn parse_stream<R: Read>(reader: R) -> Parser<BufReader<R>> {
    Parser::new(BufReader::new(reader))
}

/// Decode every payload in an in-memory buffer
pub fn parse_bytes(data: &[u8]) -> Vec<Result<Reply>> {
    Parser::new(data).collect()
}

/// Decode the first payload in an in-memory buffer
pub fn parse_one(data: &[u8]) -> Result<Reply> {
    Parser::new(data)
        .next()
        .unwrap_or_else(|| Err(EmberError::Protocol("no payload in buffer".to_string())))
}

/// Multi-bulk frame being assembled
struct PendingMultiBulk {
    expected: usize,
    args: Vec<Option<Vec<u8>>>,
}

/// Streaming RESP decoder
///
/// Iterates over `Result<Reply>`. Each call pulls only as many bytes as the
/// next payload needs, so it works on sockets as well as files.
pub struct Parser<R> {
    reader: R,
    pending: Option<PendingMultiBulk>,
    done: bool,

    /// Bytes taken from `reader` so far
    consumed: u64,
}

impl<R: BufRead> Parser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: None,
            done: false,
            consumed: 0,
        }
    }

    /// Bytes consumed from the reader so far.
    ///
    /// Between payloads this is the offset just past the last complete frame.
    pub fn position(&self) -> u64 {
        self.consumed
    }

    /// Get a reference to the underlying reader
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read frames until one payload is complete. `Ok(None)` is a clean end of stream.
    fn read_payload(&mut self) -> Result<Option<Reply>> {
        loop {
            let line = match self.read_line()? {
                Some(line) => line,
                None if self.pending.is_some() => {
                    return Err(unexpected_eof("stream ended inside a multi-bulk"));
                }
                None => return Ok(None),
            };

            if let Some(reply) = self.handle_line(&line)? {
                return Ok(Some(reply));
            }
        }
    }

    /// Read one CRLF-terminated line, without the terminator
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line)?;
        self.consumed += read as u64;
        if read == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            return Err(unexpected_eof("stream ended inside a line"));
        }
        if line.len() < 3 || line[line.len() - 2] != b'\r' {
            return Err(EmberError::Protocol(format!(
                "bad line terminator in {:?}",
                String::from_utf8_lossy(&line)
            )));
        }
        line.truncate(line.len() - 2);
        Ok(Some(line))
    }

    /// Read exactly `len` bytes plus the trailing CRLF
    ///
    /// The buffer grows with the bytes that actually arrive, so a large
    /// header alone cannot force a large allocation.
    fn read_bulk_body(&mut self, len: usize) -> Result<Vec<u8>> {
        let wanted = len as u64 + 2;
        let mut body = Vec::with_capacity((len + 2).min(BULK_PREALLOC_LIMIT));
        let read = (&mut self.reader).take(wanted).read_to_end(&mut body)?;
        self.consumed += read as u64;
        if (read as u64) < wanted {
            return Err(unexpected_eof("stream ended inside a bulk string"));
        }
        if !body.ends_with(CRLF) {
            return Err(EmberError::Protocol(format!(
                "bulk string of length {} is not followed by CRLF",
                len
            )));
        }
        body.truncate(len);
        Ok(body)
    }

    fn handle_line(&mut self, line: &[u8]) -> Result<Option<Reply>> {
        if self.pending.is_some() {
            return self.handle_multi_bulk_arg(line);
        }

        match line[0] {
            b'*' => self.begin_multi_bulk(line),
            b'$' => match parse_header(line, "bulk string")? {
                -1 => Ok(Some(Reply::NULL_BULK)),
                len => {
                    let len = check_bulk_len(len, line)?;
                    Ok(Some(Reply::Bulk(Some(self.read_bulk_body(len)?))))
                }
            },
            b'+' => Ok(Some(Reply::Status(lossy(&line[1..]).into()))),
            b'-' => Ok(Some(Reply::Error(lossy(&line[1..]).into()))),
            b':' => parse_int(&line[1..])
                .map(|value| Some(Reply::Integer(value)))
                .ok_or_else(|| illegal("integer", line)),
            _ => Err(EmberError::Protocol(format!(
                "unexpected line {:?}",
                lossy(line)
            ))),
        }
    }

    fn begin_multi_bulk(&mut self, line: &[u8]) -> Result<Option<Reply>> {
        let count = parse_header(line, "multi-bulk")?;
        if count == 0 || count == -1 {
            return Ok(Some(Reply::EMPTY_MULTI_BULK));
        }
        if count < 0 || count as u64 > MAX_MULTI_BULK_LEN as u64 {
            return Err(illegal("multi-bulk", line));
        }

        let expected = count as usize;
        self.pending = Some(PendingMultiBulk {
            expected,
            args: Vec::with_capacity(expected.min(64)),
        });
        Ok(None)
    }

    fn handle_multi_bulk_arg(&mut self, line: &[u8]) -> Result<Option<Reply>> {
        if line[0] != b'$' {
            return Err(EmberError::Protocol(format!(
                "expected bulk string header, got {:?}",
                lossy(line)
            )));
        }

        let arg = match parse_header(line, "bulk string")? {
            -1 => None,
            len => {
                let len = check_bulk_len(len, line)?;
                Some(self.read_bulk_body(len)?)
            }
        };

        let complete = match self.pending.as_mut() {
            Some(pending) => {
                pending.args.push(arg);
                pending.args.len() == pending.expected
            }
            None => false,
        };
        if !complete {
            return Ok(None);
        }
        Ok(self.pending.take().map(|pending| Reply::MultiBulk(pending.args)))
    }
}

impl<R: BufRead> Iterator for Parser<R> {
    type Item = Result<Reply>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.read_payload() {
            Ok(Some(reply)) => Some(Ok(reply)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                // Resynchronize on the next line; only I/O failures are terminal
                self.pending = None;
                if !err.is_protocol() {
                    self.done = true;
                }
                Some(Err(err))
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_int(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn parse_header(line: &[u8], what: &str) -> Result<i64> {
    parse_int(&line[1..]).ok_or_else(|| illegal(what, line))
}

fn check_bulk_len(len: i64, line: &[u8]) -> Result<usize> {
    if len < 0 || len as u64 > MAX_BULK_LEN as u64 {
        return Err(illegal("bulk string", line));
    }
    Ok(len as usize)
}

fn illegal(what: &str, line: &[u8]) -> EmberError {
    EmberError::Protocol(format!("illegal {} header {:?}", what, lossy(line)))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn unexpected_eof(message: &str) -> EmberError {
    EmberError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, message.to_string()))
}
