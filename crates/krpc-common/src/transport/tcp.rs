use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::protocol::error::{KrpcError, Result};
use crate::protocol::{Endpoint, Message};
use crate::transport::codec::SerializerKind;
use crate::transport::frame::{Frame, FrameCodec};

/// A TCP stream speaking the krpc frame format.
pub type FramedStream = Framed<TcpStream, FrameCodec>;

/// Connects to an endpoint, trying every resolved address until one succeeds.
///
/// # Errors
///
/// Returns `Timeout` if no connection is established within `timeout`, and
/// `Transport` if the address cannot be resolved or every attempt is refused.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<FramedStream> {
    tokio::time::timeout(timeout, connect_any(&endpoint.to_string()))
        .await
        .map_err(|_| KrpcError::Timeout(timeout.as_millis() as u64))?
}

async fn connect_any(addr: &str) -> Result<FramedStream> {
    let socket_addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| KrpcError::Transport(format!("Invalid address '{}': {}", addr, e)))?;

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(Framed::new(stream, FrameCodec::new()));
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(KrpcError::Transport(format!(
        "Failed to connect to {}: {}",
        addr,
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses resolved".to_string())
    )))
}

/// Frames and sends one envelope.
pub async fn send_message(
    stream: &mut FramedStream,
    message: &Message,
    serializer: SerializerKind,
) -> Result<()> {
    let frame = Frame::from_message(message, serializer)?;
    stream.send(frame).await.map_err(map_io_error)
}

/// Reads the next frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly.
pub async fn receive_frame(stream: &mut FramedStream) -> Result<Option<Frame>> {
    match stream.next().await {
        Some(Ok(frame)) => Ok(Some(frame)),
        Some(Err(e)) => Err(map_io_error(e)),
        None => Ok(None),
    }
}

/// Map IO errors to transport-level errors
///
/// Protocol and serialization errors pass through untouched.
pub fn map_io_error(err: KrpcError) -> KrpcError {
    match err {
        KrpcError::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => {
                KrpcError::Transport(format!("Connection lost: {}", io))
            }
            _ => KrpcError::Io(io),
        },
        other => other,
    }
}
