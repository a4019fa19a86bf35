//! Frames on the master/worker socket.
//!
//! Layout on the wire:
//! `[length: u32 big-endian][kind: u8][body: length - 1 bytes]`
//!
//! `length` counts the kind byte plus the body. Bodies are opaque except for
//! the few fields the master needs to route (pids, session ids, document
//! ids), which are big-endian integers or UTF-8 text.
//!
//! Every request from the master is answered by exactly one terminal frame
//! (`Loaded`, `LoadFailed`, `Done`, `Pong` or `Error`), optionally preceded by
//! `Delta` frames in emission order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cowrite_core::{SessionId, WorkerError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const LENGTH_SIZE: usize = 4;

/// Largest body accepted in either direction (16 MiB).
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Errors from encoding or decoding worker frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Body exceeds [`MAX_BODY_SIZE`]
    #[error("frame body of {size} bytes exceeds {max}")]
    TooLarge {
        /// Claimed or actual body size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Fewer bytes than the length prefix claims
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the prefix promised
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Length prefix of zero (no room for the kind byte)
    #[error("empty frame")]
    Empty,

    /// Kind byte not in [`FrameKind`]
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    /// Body does not match what its kind requires
    #[error("malformed {kind:?} body: {reason}")]
    Malformed {
        /// Kind of the offending frame
        kind: FrameKind,
        /// What was wrong
        reason: &'static str,
    },

    /// Socket error
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<FrameError> for WorkerError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(msg) => Self::Io(msg),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Worker introduces itself: `[pid: u32][engine version: utf8]`
    Hello = 0x01,
    /// Open a document: `[document id: utf8]`
    Load = 0x02,
    /// Document opened
    Loaded = 0x03,
    /// Document refused: `[reason: utf8]`
    LoadFailed = 0x04,
    /// Add a session: `[session: u64]`
    Join = 0x05,
    /// Remove a session: `[session: u64]`
    Leave = 0x06,
    /// Apply an edit: `[session: u64][payload]`
    Edit = 0x07,
    /// One delta or join payload: `[payload]`
    Delta = 0x08,
    /// End of a reply
    Done = 0x09,
    /// Persist pending changes
    Flush = 0x0a,
    /// Heartbeat request
    Ping = 0x0b,
    /// Heartbeat reply
    Pong = 0x0c,
    /// Worker-side failure: `[message: utf8]`
    Error = 0x0d,
    /// Master asks the worker to exit
    Terminate = 0x0e,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x01 => FrameKind::Hello,
            0x02 => FrameKind::Load,
            0x03 => FrameKind::Loaded,
            0x04 => FrameKind::LoadFailed,
            0x05 => FrameKind::Join,
            0x06 => FrameKind::Leave,
            0x07 => FrameKind::Edit,
            0x08 => FrameKind::Delta,
            0x09 => FrameKind::Done,
            0x0a => FrameKind::Flush,
            0x0b => FrameKind::Ping,
            0x0c => FrameKind::Pong,
            0x0d => FrameKind::Error,
            0x0e => FrameKind::Terminate,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

/// One frame on the worker socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFrame {
    /// Frame kind
    pub kind: FrameKind,
    /// Raw body
    pub body: Bytes,
}

impl WorkerFrame {
    /// Frame with the given kind and body.
    pub fn new(kind: FrameKind, body: impl Into<Bytes>) -> Self {
        Self { kind, body: body.into() }
    }

    /// Frame with an empty body.
    pub fn bare(kind: FrameKind) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// `Hello` from worker `pid` running `engine_version`.
    pub fn hello(pid: u32, engine_version: &str) -> Self {
        let mut body = BytesMut::with_capacity(4 + engine_version.len());
        body.put_u32(pid);
        body.put_slice(engine_version.as_bytes());
        Self::new(FrameKind::Hello, body.freeze())
    }

    /// Frame whose body is UTF-8 text.
    pub fn text(kind: FrameKind, text: &str) -> Self {
        Self::new(kind, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Frame addressed to one session, with an optional payload.
    pub fn for_session(kind: FrameKind, session: SessionId, payload: &[u8]) -> Self {
        let mut body = BytesMut::with_capacity(8 + payload.len());
        body.put_u64(session.as_u64());
        body.put_slice(payload);
        Self::new(kind, body.freeze())
    }

    /// Parse a `Hello` body into `(pid, engine version)`.
    pub fn parse_hello(&self) -> Result<(u32, String), FrameError> {
        self.expect_kind(FrameKind::Hello)?;
        if self.body.len() < 4 {
            return Err(self.malformed("missing pid"));
        }
        let mut body = self.body.clone();
        let pid = body.get_u32();
        let version =
            String::from_utf8(body.to_vec()).map_err(|_| self.malformed("version is not utf8"))?;
        Ok((pid, version))
    }

    /// Parse a session-addressed body into `(session, payload)`.
    pub fn parse_session(&self) -> Result<(SessionId, Bytes), FrameError> {
        if self.body.len() < 8 {
            return Err(self.malformed("missing session id"));
        }
        let mut body = self.body.clone();
        let session = SessionId::from_raw(body.get_u64());
        Ok((session, body))
    }

    /// Body as UTF-8 text, lossy.
    pub fn text_body(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Encode into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), FrameError> {
        if self.body.len() > MAX_BODY_SIZE {
            return Err(FrameError::TooLarge { size: self.body.len(), max: MAX_BODY_SIZE });
        }

        // Bounded by MAX_BODY_SIZE above, so the prefix fits in u32.
        let length = (self.body.len() + 1) as u32;
        dst.put_u32(length);
        dst.put_u8(self.kind as u8);
        dst.put_slice(&self.body);
        Ok(())
    }

    /// Decode one frame from the front of `bytes`. Trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < LENGTH_SIZE {
            return Err(FrameError::Truncated { expected: LENGTH_SIZE, actual: bytes.len() });
        }

        let mut prefix = [0u8; LENGTH_SIZE];
        prefix.copy_from_slice(&bytes[..LENGTH_SIZE]);
        let length = check_length(u32::from_be_bytes(prefix))?;

        let rest = &bytes[LENGTH_SIZE..];
        let Some(frame) = rest.get(..length) else {
            return Err(FrameError::Truncated { expected: length, actual: rest.len() });
        };

        let kind = FrameKind::try_from(frame[0])?;
        Ok(Self { kind, body: Bytes::copy_from_slice(&frame[1..]) })
    }

    /// Read one frame. Returns `None` on a clean end of stream between frames.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>, FrameError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut prefix = [0u8; LENGTH_SIZE];
        match reader.read_exact(&mut prefix).await {
            Ok(_) => {},
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let length = check_length(u32::from_be_bytes(prefix))?;
        let mut frame = vec![0u8; length];
        reader.read_exact(&mut frame).await?;

        let kind = FrameKind::try_from(frame[0])?;
        let body = Bytes::from(frame).slice(1..);
        Ok(Some(Self { kind, body }))
    }

    /// Write one frame and flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = BytesMut::with_capacity(LENGTH_SIZE + 1 + self.body.len());
        self.encode(&mut buf)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    fn expect_kind(&self, kind: FrameKind) -> Result<(), FrameError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(FrameError::Malformed { kind: self.kind, reason: "unexpected frame kind" })
        }
    }

    fn malformed(&self, reason: &'static str) -> FrameError {
        FrameError::Malformed { kind: self.kind, reason }
    }
}

/// Validate a length prefix and return it as a frame size.
fn check_length(length: u32) -> Result<usize, FrameError> {
    let length = length as usize;
    if length == 0 {
        return Err(FrameError::Empty);
    }
    if length - 1 > MAX_BODY_SIZE {
        return Err(FrameError::TooLarge { size: length - 1, max: MAX_BODY_SIZE });
    }
    Ok(length)
}
