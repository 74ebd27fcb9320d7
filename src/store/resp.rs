/// Redis RESP (Redis Serialization Protocol) parsing and generation
///
/// The parser is incremental: it only consumes bytes from the buffer once a
/// complete frame is available, so a reply split across several socket
/// reads is simply parsed again after the next read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;

const CRLF: &[u8] = b"\r\n";

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n)
    BulkString(Option<Bytes>), // None represents NULL
    /// Array (*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n)
    Array(Option<Vec<RespValue>>), // None represents NULL array
}

/// RESP parser for reading Redis protocol messages
pub struct RespParser;

/// RESP encoder for writing Redis protocol messages
pub struct RespEncoder;

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Invalid integer: {0}")]
    InvalidInteger(String),
}

impl RespValue {
    /// Build a bulk string from anything byte-like
    pub fn bulk<B: AsRef<[u8]>>(data: B) -> Self {
        RespValue::BulkString(Some(Bytes::copy_from_slice(data.as_ref())))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            RespValue::BulkString(Some(data)) => btoi::btoi(data).ok(),
            RespValue::SimpleString(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// String payload of a simple or bulk string
    pub fn into_string(self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(Some(data)) => Some(String::from_utf8_lossy(&data).into_owned()),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(Some(elements)) => Some(elements),
            _ => None,
        }
    }
}

impl RespParser {
    /// Parse one RESP value from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves the buffer untouched when the frame is
    /// not complete yet.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        match Self::parse_at(buf, 0)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse multiple values from a buffer
    pub fn parse_all(buf: &mut BytesMut) -> Result<Vec<RespValue>, RespParseError> {
        let mut values = Vec::new();
        while let Some(value) = Self::parse(buf)? {
            values.push(value);
        }
        Ok(values)
    }

    fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let (line, next) = match Self::read_line(buf, pos) {
            Some(found) => found,
            None => return Ok(None),
        };
        if line.is_empty() {
            return Err(RespParseError::InvalidFormat("empty line".to_string()));
        }

        let body = &line[1..];
        match line[0] {
            b'+' => Ok(Some((
                RespValue::SimpleString(str::from_utf8(body)?.to_string()),
                next,
            ))),
            b'-' => Ok(Some((RespValue::Error(str::from_utf8(body)?.to_string()), next))),
            b':' => Ok(Some((RespValue::Integer(Self::parse_int(body)?), next))),
            b'$' => Self::parse_bulk_string(buf, body, next),
            b'*' => Self::parse_array(buf, body, next),
            other => Err(RespParseError::InvalidFormat(format!(
                "Unknown RESP type: {}",
                other as char
            ))),
        }
    }

    fn parse_bulk_string(
        buf: &[u8],
        size_line: &[u8],
        pos: usize,
    ) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let size = Self::parse_int(size_line)?;
        if size == -1 {
            return Ok(Some((RespValue::BulkString(None), pos)));
        }
        if size < 0 {
            return Err(RespParseError::InvalidFormat(
                "Invalid bulk string size".to_string(),
            ));
        }

        let end = match usize::try_from(size).ok().and_then(|size| pos.checked_add(size)) {
            Some(end) if end <= usize::MAX - CRLF.len() => end,
            _ => {
                return Err(RespParseError::InvalidFormat(
                    "Bulk string size out of range".to_string(),
                ))
            }
        };
        if buf.len() < end + CRLF.len() {
            return Ok(None);
        }
        if &buf[end..end + CRLF.len()] != CRLF {
            return Err(RespParseError::InvalidFormat(
                "Missing \\r\\n after bulk string".to_string(),
            ));
        }

        let content = Bytes::copy_from_slice(&buf[pos..end]);
        Ok(Some((RespValue::BulkString(Some(content)), end + CRLF.len())))
    }

    fn parse_array(
        buf: &[u8],
        size_line: &[u8],
        pos: usize,
    ) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let size = Self::parse_int(size_line)?;
        if size == -1 {
            return Ok(Some((RespValue::Array(None), pos)));
        }
        if size < 0 {
            return Err(RespParseError::InvalidFormat("Invalid array size".to_string()));
        }

        // the header is untrusted; every element takes at least one byte
        let capacity = usize::try_from(size)
            .unwrap_or(usize::MAX)
            .min(buf.len().saturating_sub(pos));
        let mut elements = Vec::with_capacity(capacity);
        let mut cursor = pos;
        for _ in 0..size {
            match Self::parse_at(buf, cursor)? {
                Some((element, next)) => {
                    elements.push(element);
                    cursor = next;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((RespValue::Array(Some(elements)), cursor)))
    }

    fn parse_int(digits: &[u8]) -> Result<i64, RespParseError> {
        btoi::btoi::<i64>(digits).map_err(|_| {
            RespParseError::InvalidInteger(String::from_utf8_lossy(digits).into_owned())
        })
    }

    /// Find the line starting at `pos`, returning it without \r\n plus the
    /// offset just past the terminator
    fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
        if buf.len() < pos + CRLF.len() {
            return None;
        }
        buf[pos..]
            .windows(CRLF.len())
            .position(|w| w == CRLF)
            .map(|i| (&buf[pos..pos + i], pos + i + CRLF.len()))
    }
}

impl RespEncoder {
    /// Encode a RESP value to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    /// Encode a RESP value into an existing buffer
    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.extend_from_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
        }
    }

    /// Create a Redis command from command name and arguments
    pub fn create_command<S: AsRef<str>>(command: &str, args: &[S]) -> RespValue {
        let mut elements = Vec::with_capacity(args.len() + 1);
        elements.push(RespValue::bulk(command));
        elements.extend(args.iter().map(|arg| RespValue::bulk(arg.as_ref())));
        RespValue::Array(Some(elements))
    }
}
