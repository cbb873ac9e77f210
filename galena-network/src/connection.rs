//! Framed byte transport: every message is 8 ASCII decimal digits of
//! payload length, zero-padded, followed by exactly that many bytes of
//! UTF-8 JSON.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::addr::Addr;

/// Width of the decimal length prefix.
pub const LENGTH_PREFIX: usize = 8;

pub async fn write_framed<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() >= 10usize.pow(LENGTH_PREFIX as u32) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "payload exceeds frame length field",
        ));
    }
    let prefix = format!("{:08}", payload.len());
    writer.write_all(prefix.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

pub async fn read_framed<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    reader.read_exact(&mut prefix).await?;
    let text = std::str::from_utf8(&prefix)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length prefix is not ASCII"))?;
    let size: usize = text
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length prefix is not decimal"))?;
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Short-lived outbound dials with a per-dial timeout. Transport failures
/// are logged and surfaced as `None`; callers treat the peer as
/// unreachable and move on.
#[derive(Debug, Clone)]
pub struct Connection {
    pub addr: Addr,
    pub timeout: Duration,
}

impl Connection {
    pub fn new(addr: Addr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub async fn connect_to(&self, dst: &Addr) -> Option<TcpStream> {
        match timeout(self.timeout, TcpStream::connect((dst.ip.as_str(), dst.port))).await {
            Ok(Ok(stream)) => {
                debug!(from = %self.addr.hostname(), to = %dst.hostname(), "connected");
                Some(stream)
            }
            Ok(Err(err)) => {
                error!(to = %dst.hostname(), %err, "connection failed");
                None
            }
            Err(_) => {
                debug!(to = %dst.hostname(), "connection timed out");
                None
            }
        }
    }

    /// Dial `dst`, send one framed message and optionally wait for one
    /// framed reply.
    pub async fn connect_and_send(
        &self,
        dst: &Addr,
        data: &str,
        wait_for_reply: bool,
    ) -> Option<Vec<u8>> {
        let mut stream = self.connect_to(dst).await?;
        if let Err(err) = write_framed(&mut stream, data.as_bytes()).await {
            error!(to = %dst.hostname(), %err, "could not write message");
            return None;
        }
        if !wait_for_reply {
            return Some(Vec::new());
        }
        match timeout(self.timeout, read_framed(&mut stream)).await {
            Ok(Ok(reply)) => {
                debug!(from = %dst.hostname(), bytes = reply.len(), "received reply");
                Some(reply)
            }
            Ok(Err(err)) => {
                error!(from = %dst.hostname(), %err, "could not read reply");
                None
            }
            Err(_) => {
                debug!(from = %dst.hostname(), "reply timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_framed(&mut client, br#"{"ping":true}"#).await.unwrap();
        let got = read_framed(&mut server).await.unwrap();
        assert_eq!(got, br#"{"ping":true}"#);
    }

    #[tokio::test]
    async fn prefix_is_zero_padded_decimal() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_framed(&mut client, b"abc").await.unwrap();
        let mut raw = [0u8; 11];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(&raw[..8], b"00000003");
        assert_eq!(&raw[8..], b"abc");
    }

    #[tokio::test]
    async fn bad_prefix_is_invalid_data() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"garbage!xx")
            .await
            .unwrap();
        let err = read_framed(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn empty_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_framed(&mut client, b"").await.unwrap();
        let got = read_framed(&mut server).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn dial_to_dead_port_returns_none() {
        let conn = Connection::new(Addr::new("127.0.0.1", 1), Duration::from_millis(300));
        // port 1 on loopback refuses or times out either way
        assert!(conn
            .connect_and_send(&Addr::new("127.0.0.1", 1), "{}", true)
            .await
            .is_none());
    }
}
