//! RESP (REdis Serialization Protocol) codec
//!
//! Commands are always sent as arrays of bulk strings. Replies are parsed
//! incrementally: [`parse_reply`] returns `Ok(None)` until a full reply is
//! buffered.

use alloc::string::String;
use alloc::vec::Vec;

use thiserror_no_std::Error;

/// Arrays deeper than this are rejected
const MAX_DEPTH: usize = 4;

/// Largest bulk string accepted from the server
pub const MAX_BULK_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string
    Bulk(Option<Vec<u8>>),
    /// `None` is the null array
    Array(Option<Vec<Reply>>),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    #[error("unknown reply type byte {0:#04x}")]
    UnknownType(u8),
    #[error("malformed integer")]
    BadInteger,
    #[error("malformed length")]
    BadLength,
    #[error("bulk string not terminated by CRLF")]
    MissingTerminator,
    #[error("reply nested too deep")]
    TooDeep,
}

/// Append `args` to `out` as a RESP array of bulk strings.
pub fn encode_command(args: &[&str], out: &mut Vec<u8>) {
    push_header(out, b'*', args.len());
    for arg in args {
        push_header(out, b'$', arg.len());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

fn push_header(out: &mut Vec<u8>, kind: u8, len: usize) {
    out.push(kind);
    let mut digits = [0u8; 20];
    let mut n = len;
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    out.extend_from_slice(&digits[i..]);
    out.extend_from_slice(b"\r\n");
}

/// Parse one reply from the front of `buf`.
///
/// Returns the reply and the number of bytes it occupied, or `None` if more
/// bytes are needed.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, RespError> {
    parse_at(buf, 0, 0)
}

fn parse_at(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(Reply, usize)>, RespError> {
    let Some(&kind) = buf.get(pos) else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let line = &buf[pos + 1..line_end];
    let next = line_end + 2;

    match kind {
        b'+' => Ok(Some((Reply::Simple(text(line)), next))),
        b'-' => Ok(Some((Reply::Error(text(line)), next))),
        b':' => Ok(Some((Reply::Integer(integer(line)?), next))),
        b'$' => {
            let len = integer(line)?;
            if len == -1 {
                return Ok(Some((Reply::Bulk(None), next)));
            }
            let len = usize::try_from(len).map_err(|_| RespError::BadLength)?;
            if len > MAX_BULK_LEN {
                return Err(RespError::BadLength);
            }
            if buf.len() < next + len + 2 {
                return Ok(None);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err(RespError::MissingTerminator);
            }
            Ok(Some((Reply::Bulk(Some(buf[next..next + len].to_vec())), next + len + 2)))
        }
        b'*' => {
            let count = integer(line)?;
            if count == -1 {
                return Ok(Some((Reply::Array(None), next)));
            }
            let count = usize::try_from(count).map_err(|_| RespError::BadLength)?;
            if depth >= MAX_DEPTH {
                return Err(RespError::TooDeep);
            }

            let mut items = Vec::new();
            let mut cursor = next;
            for _ in 0..count {
                match parse_at(buf, cursor, depth + 1)? {
                    Some((item, end)) => {
                        items.push(item);
                        cursor = end;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(Some(items)), cursor)))
        }
        other => Err(RespError::UnknownType(other)),
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn integer(line: &[u8]) -> Result<i64, RespError> {
    core::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RespError::BadInteger)
}
