//! Length-prefixed JSON framing over TCP, plus listener bind helpers.
//!
//! Every frame is an 8-byte big-endian length followed by a UTF-8 JSON
//! document. All node-to-node and client-to-node exchanges use this framing;
//! callers impose their own deadlines with `tokio::time::timeout`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{self, Duration};

use crate::utils::RookeryError;

/// Hard cap on a single frame body, guarding against bogus length prefixes.
const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Number of ports probed (and bind attempts made) by
/// `tcp_bind_with_retry()` before giving up.
pub const BIND_ATTEMPTS: u16 = 5;

/// Reads one length-prefixed JSON frame and decodes it into `T`.
pub async fn read_frame<T, Conn>(conn: &mut Conn) -> Result<T, RookeryError>
where
    T: DeserializeOwned,
    Conn: AsyncRead + Unpin,
{
    let bytes = read_frame_raw(conn).await?;
    let obj = serde_json::from_slice(&bytes)?;
    Ok(obj)
}

/// Reads one length-prefixed frame and returns the undecoded body bytes.
/// Used by the balancer, which relays payloads untouched.
pub async fn read_frame_raw<Conn>(
    conn: &mut Conn,
) -> Result<Vec<u8>, RookeryError>
where
    Conn: AsyncRead + Unpin,
{
    let len = conn.read_u64().await?;
    if len > MAX_FRAME_LEN {
        return logged_err!("refusing oversized frame of {} bytes", len);
    }

    let mut buf = vec![0u8; len as usize];
    conn.read_exact(&mut buf[..]).await?;
    Ok(buf)
}

/// Encodes `obj` as JSON and writes it as one length-prefixed frame.
pub async fn write_frame<T, Conn>(
    conn: &mut Conn,
    obj: &T,
) -> Result<(), RookeryError>
where
    T: Serialize,
    Conn: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(obj)?;
    write_frame_raw(conn, &bytes).await
}

/// Writes pre-encoded body bytes as one length-prefixed frame.
pub async fn write_frame_raw<Conn>(
    conn: &mut Conn,
    bytes: &[u8],
) -> Result<(), RookeryError>
where
    Conn: AsyncWrite + Unpin,
{
    conn.write_u64(bytes.len() as u64).await?;
    conn.write_all(bytes).await?;
    conn.flush().await?;
    Ok(())
}

/// Binds a TCP listener, walking up from `base_port` through
/// `base_port + BIND_ATTEMPTS - 1` with exponential backoff between
/// attempts. Returns the listener and the port actually bound. Failing all
/// attempts is fatal for the calling node.
pub async fn tcp_bind_with_retry(
    host: &str,
    base_port: u16,
) -> Result<(TcpListener, u16), RookeryError> {
    for attempt in 0..BIND_ATTEMPTS {
        let port = base_port + attempt;
        let bind_addr = format!("{}:{}", host, port);
        match TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                pf_info!("bound listener on '{}'", bind_addr);
                return Ok((listener, port));
            }
            Err(e) => {
                pf_warn!(
                    "bind attempt {} of {} on '{}' failed: {}",
                    attempt + 1,
                    BIND_ATTEMPTS,
                    bind_addr,
                    e
                );
                if attempt + 1 < BIND_ATTEMPTS {
                    time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }
        }
    }

    logged_err!(
        "failed to bind any port in {}..={}",
        base_port,
        base_port + BIND_ATTEMPTS - 1
    )
}

#[cfg(test)]
mod wire_tests {
    use super::*;
    use serde::Deserialize;
    use tokio::net::TcpStream;

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct TestMsg {
        action: String,
        seq: u64,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frame_round_trip() -> Result<(), RookeryError> {
        let (listener, port) = tcp_bind_with_retry("127.0.0.1", 41200).await?;
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await?;
            let msg: TestMsg = read_frame(&mut conn).await?;
            write_frame(&mut conn, &msg).await?;
            Ok::<(), RookeryError>(())
        });

        let mut conn =
            TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
        let sent = TestMsg {
            action: "SERVER_PING".into(),
            seq: 7,
        };
        write_frame(&mut conn, &sent).await?;
        let echoed: TestMsg = read_frame(&mut conn).await?;
        assert_eq!(echoed, sent);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_walks_past_taken_port() -> Result<(), RookeryError> {
        let (_taken, port) = tcp_bind_with_retry("127.0.0.1", 41210).await?;
        assert_eq!(port, 41210);
        let (_next, port) = tcp_bind_with_retry("127.0.0.1", 41210).await?;
        assert_eq!(port, 41211);
        Ok(())
    }
}
