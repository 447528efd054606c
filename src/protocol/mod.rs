//! Wire protocol definitions and constants
//!
//! The handshake is a fixed sequence of fields on the authenticated stream:
//!
//! ```text
//! client → server   hello        u16 BE length + UTF-8 (ignored)
//! client → server   secret       64 bytes, password zero-padded
//! client → server   timeout      i32 BE, milliseconds
//! server → client   status       1 byte
//! client → server   host         u16 BE length + UTF-8
//! client → server   port         u16 BE
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("String too long: {0} bytes")]
    StringTooLong(usize),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Password too long: {0} bytes (max 64)")]
    PasswordTooLong(usize),

    #[error("Negative timeout: {0} ms")]
    NegativeTimeout(i32),
}

/// Length of the shared secret on the wire
pub const SECRET_LEN: usize = 64;

/// Relay buffer size per direction (512 KB)
pub const RELAY_BUFFER_SIZE: usize = 512 * 1024;

/// Read timeout while the client is handshaking
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout on both sides during normal transfer
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout when connecting to the destination
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a finished tunnel waits for its peer relay task
pub const PEER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on shutting down a relay's sink during an orderly close
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Status byte sent after authentication
///
/// Only [`Status::Ok`] is produced by the server today. The other codes are
/// part of the protocol vocabulary shared with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    ProtocolViolation = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Shared secret, as it appears on the wire
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    /// Build the wire secret from a password: UTF-8 bytes, zero-padded to 64.
    pub fn from_password(password: &str) -> Result<Self, ProtocolError> {
        let bytes = password.as_bytes();
        if bytes.len() > SECRET_LEN {
            return Err(ProtocolError::PasswordTooLong(bytes.len()));
        }
        let mut secret = [0u8; SECRET_LEN];
        secret[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(secret))
    }

    /// Plain byte-for-byte comparison. Not constant time.
    pub fn matches(&self, candidate: &[u8; SECRET_LEN]) -> bool {
        self.0 == *candidate
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Read a u16-length-prefixed UTF-8 string
pub async fn read_utf<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ProtocolError> {
    let len = reader.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Consume a u16-length-prefixed string without decoding it; returns its
/// length in bytes. Java's `writeUTF` emits modified UTF-8, which a strict
/// decoder may reject.
pub async fn skip_utf<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, ProtocolError> {
    let len = reader.read_u16().await?;
    let mut body = (&mut *reader).take(u64::from(len));
    let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
    if skipped < u64::from(len) {
        return Err(ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(usize::from(len))
}

fn put_utf(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Client side of the handshake, for cooperating clients
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub hello: String,
    pub secret: Secret,
    /// Read timeout the server should use until the destination is known
    pub timeout_ms: i32,
    pub host: String,
    pub port: u16,
}

impl HandshakeRequest {
    /// Everything the client sends before the status byte
    pub fn encode_auth(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(2 + self.hello.len() + SECRET_LEN + 4);
        put_utf(&mut buf, &self.hello)?;
        buf.put_slice(self.secret.as_bytes());
        buf.put_i32(self.timeout_ms);
        Ok(buf.freeze())
    }

    /// The destination request sent after the status byte
    pub fn encode_destination(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(2 + self.host.len() + 2);
        put_utf(&mut buf, &self.host)?;
        buf.put_u16(self.port);
        Ok(buf.freeze())
    }

    /// Full client-to-server byte sequence
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::from(&self.encode_auth()?[..]);
        buf.put_slice(&self.encode_destination()?);
        Ok(buf.freeze())
    }
}
