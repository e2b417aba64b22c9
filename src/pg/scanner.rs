//! Draining a backend reply until ReadyForQuery.
//!
//! The scanner reads raw bytes from the socket into one reusable buffer and
//! discards everything up to and including ReadyForQuery. Row data and
//! command tags are never decoded: this measures round-trip completion, not
//! payload handling.
//!
//! Two strategies are available:
//!
//! - [`ScanStrategy::Framed`] tracks the tag and length of every message
//!   across reads and stops on the ReadyForQuery tag. An ErrorResponse in the
//!   reply is kept and returned as [`PgError::Server`] once the backend is
//!   ready again. This is the default.
//! - [`ScanStrategy::TailMatch`] checks only whether the last six bytes of
//!   each read are `Z 00 00 00 05 <status>`. It is a benchmark-only shortcut
//!   kept for comparability with earlier baseline numbers and is NOT a
//!   correct decoder: a reply whose data happens to end in that pattern at a
//!   read boundary returns early, and a ReadyForQuery split across two reads
//!   (or any read shorter than six bytes) is never recognized, so the call
//!   blocks until the next reply or EOF. Errors in the reply go unnoticed.

use std::io::{self, Read};

use bytes::Bytes;

use super::error::{PgError, PgResult};
use super::protocol::{server_error, BackendMessage, TransactionStatus, HEADER_LEN, MAX_MESSAGE_LEN};

/// Default size of the receive buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// How the end of a reply is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanStrategy {
    /// Six-byte tail heuristic. See the module docs for its failure modes.
    TailMatch,
    /// Incremental per-message framing.
    #[default]
    Framed,
}

/// Reads replies off a socket until the backend is ready for the next command.
pub struct ResponseScanner {
    buf: Box<[u8]>,
    strategy: ScanStrategy,
    cursor: FrameCursor,
}

impl ResponseScanner {
    pub fn new(strategy: ScanStrategy) -> Self {
        Self::with_buffer_size(strategy, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(strategy: ScanStrategy, size: usize) -> Self {
        Self {
            buf: vec![0u8; size.max(HEADER_LEN + 1)].into_boxed_slice(),
            strategy,
            cursor: FrameCursor::default(),
        }
    }

    pub fn strategy(&self) -> ScanStrategy {
        self.strategy
    }

    /// Read until ReadyForQuery and return its transaction status.
    ///
    /// Fails with [`PgError::Read`] on EOF or any socket error, and with
    /// [`PgError::Protocol`] when framed scanning sees a malformed frame.
    /// Under framed scanning a reply carrying an ErrorResponse fails with
    /// [`PgError::Server`] after the whole reply has been consumed.
    pub fn read_until_ready<R: Read>(&mut self, reader: &mut R) -> PgResult<TransactionStatus> {
        loop {
            let n = match reader.read(&mut self.buf) {
                Ok(0) => {
                    self.cursor.reset();
                    return Err(PgError::Read(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    )));
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.cursor.reset();
                    return Err(PgError::Read(e));
                }
            };

            let received = &self.buf[..n];
            let status = match self.strategy {
                ScanStrategy::TailMatch => tail_status(received),
                ScanStrategy::Framed => self.cursor.feed(received)?,
            };
            if let Some(status) = status {
                return Ok(status);
            }
        }
    }
}

impl Default for ResponseScanner {
    fn default() -> Self {
        Self::new(ScanStrategy::default())
    }
}

/// Status if `received` ends with a complete ReadyForQuery frame.
fn tail_status(received: &[u8]) -> Option<TransactionStatus> {
    let [.., b'Z', 0, 0, 0, 5, status] = received else {
        return None;
    };
    TransactionStatus::from_byte(*status)
}

/// Position inside the current backend message, carried across reads.
#[derive(Debug, Default)]
struct FrameCursor {
    header: [u8; HEADER_LEN],
    header_len: usize,
    body_remaining: usize,
    status: u8,
    /// First ErrorResponse of the reply, header included
    error: Option<Vec<u8>>,
    collecting: bool,
}

impl FrameCursor {
    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Consume one read's worth of bytes. Returns the status once a
    /// ReadyForQuery completes.
    fn feed(&mut self, mut chunk: &[u8]) -> PgResult<Option<TransactionStatus>> {
        while !chunk.is_empty() {
            if self.header_len < HEADER_LEN {
                let take = (HEADER_LEN - self.header_len).min(chunk.len());
                self.header[self.header_len..self.header_len + take].copy_from_slice(&chunk[..take]);
                self.header_len += take;
                chunk = &chunk[take..];
                if self.header_len < HEADER_LEN {
                    break;
                }
                self.start_body()?;
            }

            let take = self.body_remaining.min(chunk.len());
            if self.tag() == b'Z' && take > 0 {
                self.status = chunk[take - 1];
            }
            if self.collecting {
                if let Some(error) = self.error.as_mut() {
                    error.extend_from_slice(&chunk[..take]);
                }
            }
            self.body_remaining -= take;
            chunk = &chunk[take..];

            if self.body_remaining == 0 {
                let tag = self.tag();
                self.header_len = 0;
                self.collecting = false;
                if tag == b'Z' {
                    return self.finish(chunk.len()).map(Some);
                }
            }
        }
        Ok(None)
    }

    fn finish(&mut self, trailing: usize) -> PgResult<TransactionStatus> {
        let status = TransactionStatus::try_from(self.status);
        let error = self.error.take();
        self.reset();
        if trailing > 0 {
            return Err(PgError::Protocol(format!(
                "{} unexpected bytes after ReadyForQuery",
                trailing
            )));
        }
        let status = status?;
        match error {
            Some(frame) => Err(decode_error(frame)),
            None => Ok(status),
        }
    }

    fn tag(&self) -> u8 {
        self.header[0]
    }

    fn start_body(&mut self) -> PgResult<()> {
        let len = i32::from_be_bytes([self.header[1], self.header[2], self.header[3], self.header[4]]);
        let tag = self.tag();
        if len < 4 || (tag == b'Z' && len != 5) || (tag == b'E' && len as usize > MAX_MESSAGE_LEN) {
            self.reset();
            return Err(PgError::Protocol(format!(
                "invalid length {} for message '{}'",
                len, tag as char
            )));
        }
        self.body_remaining = len as usize - 4;
        if tag == b'E' && self.error.is_none() {
            let mut frame = Vec::with_capacity(HEADER_LEN + self.body_remaining);
            frame.extend_from_slice(&self.header);
            self.error = Some(frame);
            self.collecting = true;
        }
        Ok(())
    }
}

fn decode_error(frame: Vec<u8>) -> PgError {
    match BackendMessage::decode(&mut Bytes::from(frame)) {
        Ok(BackendMessage::ErrorResponse { fields }) => PgError::Server(server_error(&fields)),
        Ok(other) => PgError::Protocol(format!("expected ErrorResponse, got '{}'", other.tag())),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READY_IDLE: [u8; 6] = [b'Z', 0, 0, 0, 5, b'I'];

    #[test]
    fn test_tail_status_patterns() {
        assert_eq!(tail_status(&READY_IDLE), Some(TransactionStatus::Idle));
        assert_eq!(
            tail_status(&[b'C', b'Z', 0, 0, 0, 5, b'T']),
            Some(TransactionStatus::InTransaction)
        );
        assert_eq!(tail_status(&[b'Z', 0, 0, 0, 5, b'X']), None);
        assert_eq!(tail_status(&[0, 0, 5, b'I']), None);
    }

    #[test]
    fn test_cursor_handles_byte_at_a_time() {
        let mut cursor = FrameCursor::default();
        let stream = [b'1', 0, 0, 0, 4, b'Z', 0, 0, 0, 5, b'E'];
        let (last, rest) = stream.split_last().unwrap();
        for b in rest {
            assert_eq!(cursor.feed(std::slice::from_ref(b)).unwrap(), None);
        }
        assert_eq!(
            cursor.feed(std::slice::from_ref(last)).unwrap(),
            Some(TransactionStatus::Failed)
        );
    }

    #[test]
    fn test_cursor_rejects_bad_ready_length() {
        let mut cursor = FrameCursor::default();
        let err = cursor.feed(&[b'Z', 0, 0, 0, 6, b'I', 0]).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }

    #[test]
    fn test_cursor_rejects_oversized_error() {
        let mut cursor = FrameCursor::default();
        let err = cursor.feed(&[b'E', 0x7f, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
        assert!(cursor.error.is_none());
    }

    #[test]
    fn test_eof_is_read_error() {
        let mut scanner = ResponseScanner::default();
        let err = scanner.read_until_ready(&mut io::empty()).unwrap_err();
        assert!(matches!(err, PgError::Read(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }
}
