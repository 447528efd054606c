//! Server side of the application handshake
//!
//! Every step is timed on its own and any failure is final: the caller closes
//! the connection abortively without sending anything back, so a scanner
//! learns nothing from a wrong guess.

use crate::protocol::{read_utf, skip_utf, ProtocolError, Secret, Status, SECRET_LEN};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Handshake step, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Hello,
    Secret,
    Timeout,
    Status,
    Destination,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Hello => "hello",
            Step::Secret => "authentication",
            Step::Timeout => "timeout negotiation",
            Step::Status => "status reply",
            Step::Destination => "destination request",
        };
        f.write_str(name)
    }
}

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timeout during {0}")]
    Timeout(Step),

    #[error("error during {step}: {source}")]
    Protocol {
        step: Step,
        #[source]
        source: ProtocolError,
    },

    #[error("wrong secret")]
    BadSecret,
}

impl HandshakeError {
    pub fn step(&self) -> Step {
        match self {
            HandshakeError::Timeout(step) => *step,
            HandshakeError::Protocol { step, .. } => *step,
            HandshakeError::BadSecret => Step::Secret,
        }
    }
}

/// Destination requested by an authenticated client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

async fn timed<T, F>(step: Step, limit: Option<Duration>, fut: F) -> Result<T, HandshakeError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    let result = match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| HandshakeError::Timeout(step))?,
        None => fut.await,
    };
    result.map_err(|source| HandshakeError::Protocol { step, source })
}

/// Run the handshake and return the requested destination.
///
/// Reads up to the status byte use `read_timeout`; the destination request
/// uses whatever timeout the client asked for (0 = wait indefinitely).
pub async fn authenticate<S>(
    stream: &mut S,
    secret: &Secret,
    read_timeout: Duration,
) -> Result<Destination, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limit = Some(read_timeout);

    let hello_len = timed(Step::Hello, limit, skip_utf(&mut *stream)).await?;
    debug!("Client hello: {} bytes", hello_len);

    let mut candidate = [0u8; SECRET_LEN];
    timed(Step::Secret, limit, async {
        stream.read_exact(&mut candidate).await.map_err(ProtocolError::from)
    })
    .await?;
    if !secret.matches(&candidate) {
        return Err(HandshakeError::BadSecret);
    }

    let requested = timed(Step::Timeout, limit, async {
        stream.read_i32().await.map_err(ProtocolError::from)
    })
    .await?;
    let pooling_timeout = match requested {
        0 => None,
        ms if ms > 0 => Some(Duration::from_millis(ms as u64)),
        ms => {
            return Err(HandshakeError::Protocol {
                step: Step::Timeout,
                source: ProtocolError::NegativeTimeout(ms),
            })
        }
    };

    timed(Step::Status, None, async {
        stream.write_u8(Status::Ok as u8).await?;
        stream.flush().await.map_err(ProtocolError::from)
    })
    .await?;

    // The client may park here while the connection sits in its pool
    let host = timed(Step::Destination, pooling_timeout, read_utf(&mut *stream)).await?;
    let port = timed(Step::Destination, pooling_timeout, async {
        stream.read_u16().await.map_err(ProtocolError::from)
    })
    .await?;

    Ok(Destination { host, port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HandshakeRequest;

    fn request(password: &str, timeout_ms: i32) -> HandshakeRequest {
        HandshakeRequest {
            hello: "x".to_string(),
            secret: Secret::from_password(password).unwrap(),
            timeout_ms,
            host: "example-host".to_string(),
            port: 9999,
        }
    }

    #[tokio::test]
    async fn test_successful_handshake() {
        let secret = Secret::from_password("pw").unwrap();
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&request("pw", 5000).encode().unwrap()).await.unwrap();

        let destination = authenticate(&mut server, &secret, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(destination.host, "example-host");
        assert_eq!(destination.port, 9999);
        assert_eq!(destination.to_string(), "example-host:9999");
        assert_eq!(client.read_u8().await.unwrap(), Status::Ok as u8);
    }

    #[tokio::test]
    async fn test_wrong_secret_writes_nothing() {
        let secret = Secret::from_password("pw").unwrap();
        let (mut client, mut server) = tokio::io::duplex(1024);

        // 'v' (0x76) differs from 'w' (0x77) in a single bit
        client.write_all(&request("pv", 5000).encode().unwrap()).await.unwrap();

        let err = authenticate(&mut server, &secret, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::BadSecret));

        drop(server);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_hello_is_not_decoded() {
        let secret = Secret::from_password("pw").unwrap();
        let (mut client, mut server) = tokio::io::duplex(1024);

        // Modified UTF-8 NUL in the hello, then the regular request minus its hello
        let encoded = request("pw", 5000).encode().unwrap();
        client.write_all(&[0x00, 0x02, 0xc0, 0x80]).await.unwrap();
        client.write_all(&encoded[3..]).await.unwrap();

        let destination = authenticate(&mut server, &secret, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(destination.host, "example-host");
    }

    #[tokio::test]
    async fn test_hello_timeout() {
        let secret = Secret::from_password("pw").unwrap();
        let (_client, mut server) = tokio::io::duplex(1024);

        let err = authenticate(&mut server, &secret, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(Step::Hello)));
    }

    #[tokio::test]
    async fn test_short_secret() {
        let secret = Secret::from_password("pw").unwrap();
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&[0x00, 0x01, b'x', b'p', b'w']).await.unwrap();
        drop(client);

        let err = authenticate(&mut server, &secret, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.step(), Step::Secret);
        assert!(matches!(err, HandshakeError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_negative_timeout_rejected() {
        let secret = Secret::from_password("pw").unwrap();
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&request("pw", -1).encode_auth().unwrap()).await.unwrap();

        let err = authenticate(&mut server, &secret, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Protocol {
                step: Step::Timeout,
                source: ProtocolError::NegativeTimeout(-1)
            }
        ));
    }

    #[tokio::test]
    async fn test_requested_timeout_applies_to_destination() {
        let secret = Secret::from_password("pw").unwrap();
        let (mut client, mut server) = tokio::io::duplex(1024);

        // 50 ms for the destination, far below the handshake timeout
        client.write_all(&request("pw", 50).encode_auth().unwrap()).await.unwrap();

        let err = authenticate(&mut server, &secret, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(Step::Destination)));
        assert_eq!(client.read_u8().await.unwrap(), Status::Ok as u8);
    }
}
