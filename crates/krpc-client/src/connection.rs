use krpc_common::protocol::{
    Endpoint, KrpcError, Message, RequestEnvelope, ResponseEnvelope, Result,
};
use krpc_common::transport::tcp::{self, FramedStream};
use krpc_common::transport::SerializerKind;
use parking_lot::Mutex as SyncMutex;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One persistent TCP connection to a remote endpoint.
///
/// Calls are serialized on the stream: one request is in flight at a time
/// and its response is the next response frame on the wire. A call that is
/// abandoned halfway (for example by a caller-side timeout) leaves the
/// stream in an unknown position, so the connection is closed.
pub struct Connection {
    endpoint: Endpoint,
    serializer: SerializerKind,
    stream: Mutex<FramedStream>,
    closed: AtomicBool,
    last_write: SyncMutex<Instant>,
    shutdown: CancellationToken,
}

/// Closes the connection unless the guarded exchange ran to completion.
struct InFlight<'a> {
    connection: &'a Connection,
    completed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.connection.close();
        }
    }
}

impl Connection {
    /// Connects to `endpoint`.
    pub async fn open(
        endpoint: &Endpoint,
        serializer: SerializerKind,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let stream = tcp::connect(endpoint, connect_timeout).await?;
        tracing::debug!("Opened connection to {}", endpoint);
        Ok(Self::from_stream(endpoint.clone(), serializer, stream))
    }

    pub fn from_stream(endpoint: Endpoint, serializer: SerializerKind, stream: FramedStream) -> Self {
        Self {
            endpoint,
            serializer,
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            last_write: SyncMutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Sends `request` and waits for its response.
    ///
    /// Failure responses are returned as envelopes; only transport, protocol
    /// and serialization problems are errors here.
    pub async fn call(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
        if self.is_closed() {
            return Err(KrpcError::Transport(format!(
                "connection to {} is closed",
                self.endpoint
            )));
        }

        let mut stream = self.stream.lock().await;
        let mut guard = InFlight {
            connection: self,
            completed: false,
        };

        let message = Message::Request(request.clone());
        if let Err(e) = tcp::send_message(&mut stream, &message, self.serializer).await {
            // Nothing reached the wire unless the error is fatal to the stream
            if !e.is_connection_fatal() {
                guard.completed = true;
            }
            return Err(e);
        }
        self.touch();

        let frame = tcp::receive_frame(&mut stream).await?.ok_or_else(|| {
            KrpcError::Transport(format!("connection closed by {}", self.endpoint))
        })?;
        // The frame has been consumed in full; the stream is usable again
        guard.completed = true;

        match frame.to_message()? {
            Message::Response(response) => Ok(response),
            Message::Request(_) => {
                self.close();
                Err(KrpcError::Protocol(
                    "received a request frame where a response was expected".to_string(),
                ))
            }
        }
    }

    /// Sends a heartbeat unless a call currently owns the stream.
    ///
    /// Returns `Ok(false)` when skipped. The remote side never answers
    /// heartbeats.
    pub async fn send_heartbeat(&self) -> Result<bool> {
        let Ok(mut stream) = self.stream.try_lock() else {
            return Ok(false);
        };
        let message = Message::Request(RequestEnvelope::heartbeat());
        match tcp::send_message(&mut stream, &message, self.serializer).await {
            Ok(()) => {
                self.touch();
                Ok(true)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Whether an idle connection can be handed out again.
    ///
    /// Detects a peer that closed the connection while it sat in the pool,
    /// such as the remote idle monitor. Nothing is expected on an idle
    /// connection, so unsolicited bytes also disqualify it. An idle
    /// connection whose stream is locked is mid-heartbeat and still healthy.
    pub fn is_reusable(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(stream) = self.stream.try_lock() else {
            return true;
        };
        let mut probe = [0u8; 1];
        match stream.get_ref().try_read(&mut probe) {
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            _ => {
                drop(stream);
                self.close();
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the connection closed and stops its heartbeat.
    ///
    /// The socket itself is released when the last handle is dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Closing connection to {}", self.endpoint);
        }
        self.shutdown.cancel();
    }

    /// Time since anything was last written to the stream.
    pub fn write_idle_for(&self) -> Duration {
        self.last_write.lock().elapsed()
    }

    pub(crate) fn last_write(&self) -> Instant {
        *self.last_write.lock()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn touch(&self) {
        *self.last_write.lock() = Instant::now();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_common::protocol::{StatusCode, Value};
    use krpc_common::transport::FrameCodec;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    /// Accepts one connection and answers every normal request with `reply`.
    async fn echo_server(reply: ResponseEnvelope) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            while let Ok(Some(frame)) = tcp::receive_frame(&mut framed).await {
                if let Ok(Message::Request(request)) = frame.to_message() {
                    if request.is_heartbeat() {
                        continue;
                    }
                    let message = Message::Response(reply.clone());
                    if tcp::send_message(&mut framed, &message, frame.serializer).await.is_err() {
                        break;
                    }
                }
            }
        });
        Endpoint::from(addr)
    }

    fn request() -> RequestEnvelope {
        RequestEnvelope::new("UserService", "getUserByUserId", vec![Value::Int(1)])
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let endpoint = echo_server(ResponseEnvelope::success(Value::from("ada"))).await;
        let conn = Connection::open(&endpoint, SerializerKind::Postcard, Duration::from_secs(1))
            .await
            .unwrap();

        for _ in 0..3 {
            let response = conn.call(&request()).await.unwrap();
            assert_eq!(response.into_result().unwrap(), Value::from("ada"));
        }
        assert!(!conn.is_closed());
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn test_failure_response_is_not_an_error() {
        let endpoint =
            echo_server(ResponseEnvelope::failure(StatusCode::INTERNAL_ERROR, "boom")).await;
        let conn = Connection::open(&endpoint, SerializerKind::Json, Duration::from_secs(1))
            .await
            .unwrap();

        let response = conn.call(&request()).await.unwrap();
        assert_eq!(response.status_code, StatusCode::INTERNAL_ERROR);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_marks_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            // Read the request, then hang up without answering
            let _ = tcp::receive_frame(&mut framed).await;
        });

        let conn = Connection::open(&endpoint, SerializerKind::Json, Duration::from_secs(1))
            .await
            .unwrap();
        let result = conn.call(&request()).await;
        assert!(matches!(result, Err(KrpcError::Transport(_))));
        assert!(conn.is_closed());
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn test_abandoned_call_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // Never answer
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let conn = Connection::open(&endpoint, SerializerKind::Json, Duration::from_secs(1))
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_millis(100), conn.call(&request())).await;
        assert!(result.is_err());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_heartbeat_updates_last_write() {
        let endpoint = echo_server(ResponseEnvelope::success(Value::Null)).await;
        let conn = Connection::open(&endpoint, SerializerKind::Json, Duration::from_secs(1))
            .await
            .unwrap();

        let before = conn.last_write();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.send_heartbeat().await.unwrap());
        assert!(conn.last_write() > before);
        assert!(conn.write_idle_for() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_heartbeat_skipped_while_call_in_flight() {
        let endpoint = echo_server(ResponseEnvelope::success(Value::Null)).await;
        let conn = Connection::open(&endpoint, SerializerKind::Json, Duration::from_secs(1))
            .await
            .unwrap();

        let _held = conn.stream.lock().await;
        assert!(!conn.send_heartbeat().await.unwrap());
    }

    #[tokio::test]
    async fn test_reusable_while_heartbeat_holds_stream() {
        let endpoint = echo_server(ResponseEnvelope::success(Value::Null)).await;
        let conn = Connection::open(&endpoint, SerializerKind::Json, Duration::from_secs(1))
            .await
            .unwrap();

        {
            let _held = conn.stream.lock().await;
            assert!(conn.is_reusable());
        }
        assert!(!conn.is_closed());
        let response = conn.call(&request()).await.unwrap();
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_unencodable_request_keeps_connection() {
        let endpoint = echo_server(ResponseEnvelope::success(Value::from("ok"))).await;
        let conn = Connection::open(&endpoint, SerializerKind::Json, Duration::from_secs(1))
            .await
            .unwrap();

        let bad = RequestEnvelope::new("UserService", "scale", vec![Value::Float(f64::NAN)]);
        let result = conn.call(&bad).await;
        assert!(matches!(result, Err(KrpcError::Serialization(_))));
        assert!(!conn.is_closed());

        let response = conn.call(&request()).await.unwrap();
        assert_eq!(response.into_result().unwrap(), Value::from("ok"));
    }
}
