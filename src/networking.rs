//! Raw endpoints: a UDP socket for discovery broadcasts and TCP streams for
//! sessions, plus the length-prefixed framing every session message uses.
//! Nothing here knows what a payload is.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

use crate::error::TransportError;
use crate::MAX_FRAME_SIZE;

/// Bind the session listener with address reuse, so a restarted node can
/// take its port back while old connections linger in TIME_WAIT.
pub fn bind_listener(local_addr: SocketAddr) -> Result<TcpListener, TransportError> {
    let socket = match local_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local_addr)?;
    Ok(socket.listen(1024)?)
}

/// Dial a peer, giving up after `timeout`.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    debug!("Connecting to {}", addr);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out")))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Socket the discovery listener receives announcements on.
pub async fn bind_discovery(local_addr: SocketAddr) -> Result<UdpSocket, TransportError> {
    let socket = UdpSocket::bind(local_addr).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Unbound-port socket used only to send announcements.
pub async fn announce_socket(target: SocketAddr) -> Result<UdpSocket, TransportError> {
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Write one frame: a big-endian `u32` length followed by the body.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::Closed
        } else {
            TransportError::Io(e)
        }
    })?;
    Ok(Some(body))
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = bincode::serialize(message)?;
    write_frame(writer, &encoded).await
}

/// Read a bincode message; a clean close is reported as `Closed`.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let body = read_frame(reader).await?.ok_or(TransportError::Closed)?;
    Ok(bincode::deserialize(&body)?)
}

/// Best guess at this machine's LAN address, preferring private IPv4 ranges.
///
/// Connecting a UDP socket sends nothing; it only asks the routing table
/// which source address would be used.
pub fn local_ip() -> Option<IpAddr> {
    let targets = [
        Ipv4Addr::new(192, 168, 255, 255),
        Ipv4Addr::new(10, 255, 255, 255),
        Ipv4Addr::new(172, 31, 255, 255),
        Ipv4Addr::new(203, 0, 113, 1),
    ];

    let mut fallback = None;
    for target in targets {
        let Ok(socket) = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) else {
            continue;
        };
        if socket.connect((target, 9)).is_err() {
            continue;
        }
        let Ok(addr) = socket.local_addr() else {
            continue;
        };
        match addr.ip() {
            IpAddr::V4(ip) if ip.is_private() => return Some(IpAddr::V4(ip)),
            ip if !ip.is_loopback() && !ip.is_unspecified() => {
                fallback.get_or_insert(ip);
            }
            _ => {}
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        id: u32,
        name: String,
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello frame").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"hello frame");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
    }

    #[tokio::test]
    async fn test_clean_close_between_frames() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(10).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let greeting = Greeting { id: 7, name: "seven".into() };
        write_message(&mut a, &greeting).await.unwrap();
        let received: Greeting = read_message(&mut b).await.unwrap();
        assert_eq!(received, greeting);
    }

    #[tokio::test]
    async fn test_listener_and_connect_on_loopback() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let mut client = connect(addr, Duration::from_secs(2)).await.unwrap();
        let mut server = accept.await.unwrap();

        write_frame(&mut client, b"ping").await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"ping");
    }
}
