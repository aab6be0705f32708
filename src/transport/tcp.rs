//! Length-prefixed frames over TCP.
//!
//! Wire format: `[len: u32 BE][payload]`, one frame per prefix.

use super::traits::{TransportError, TransportResult, WireProtocol};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

/// Largest frame accepted from a peer (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// TCP connection speaking length-prefixed frames.
pub struct TcpProtocol {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl TcpProtocol {
    pub fn from_stream(stream: TcpStream) -> TransportResult<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
        })
    }

    pub async fn connect<A: ToSocketAddrs>(addr: A) -> TransportResult<Self> {
        Self::from_stream(TcpStream::connect(addr).await?)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl WireProtocol for TcpProtocol {
    async fn send_frame(&self, frame: Vec<u8>) -> TransportResult<()> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        let mut writer = self.writer.lock().await;
        writer.write_u32(frame.len() as u32).await?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv_frame(&self) -> TransportResult<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }

    async fn close(&self) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Accepts incoming participant connections.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> TransportResult<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> TransportResult<TcpProtocol> {
        let (stream, _) = self.listener.accept().await?;
        TcpProtocol::from_stream(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_loopback() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let conn = TcpProtocol::connect(addr).await.unwrap();
            conn.send_frame(b"hello".to_vec()).await.unwrap();
            conn.send_frame(Vec::new()).await.unwrap();
            conn.close().await.unwrap();
        });

        let server = acceptor.accept().await.unwrap();
        assert_eq!(server.recv_frame().await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(server.recv_frame().await.unwrap(), Some(Vec::new()));
        assert_eq!(server.recv_frame().await.unwrap(), None);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_send() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let conn = TcpProtocol::connect(addr).await.unwrap();
        let _server = acceptor.accept().await.unwrap();
        assert!(matches!(
            conn.send_frame(vec![0u8; MAX_FRAME_LEN + 1]).await,
            Err(TransportError::FrameTooLarge(_))
        ));
        assert_eq!(conn.name(), "tcp");
    }
}
