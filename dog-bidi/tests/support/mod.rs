//! Scripted in-memory transport shared by the integration tests.
//!
//! Every `open` hands the test a [`Connection`] holding the server end of the new stream,
//! so a test can play the server message by message.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dog_bidi::{
    BidiConfig, BidiError, BidiResult, BidiStream, BidiTransport, OpenParams, RetrySettings,
    StatusCode, StreamPeer, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

const STEP_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport that records every open and passes the server end to the test
pub struct FakeTransport<Req, Resp> {
    connections: mpsc::UnboundedSender<Connection<Req, Resp>>,
    opened: Mutex<Vec<OpenParams>>,
}

impl<Req, Resp> FakeTransport<Req, Resp> {
    pub fn new() -> (Arc<Self>, FakeServer<Req, Resp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            connections: tx,
            opened: Mutex::new(Vec::new()),
        });
        (transport, FakeServer { connections: rx })
    }

    /// Routing params of every stream opened so far
    pub fn opened(&self) -> Vec<OpenParams> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl<Req, Resp> BidiTransport<Req, Resp> for FakeTransport<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn open(&self, params: OpenParams) -> BidiResult<BidiStream<Req, Resp>> {
        self.opened.lock().push(params.clone());
        let (stream, peer) = BidiStream::pair();
        self.connections
            .send(Connection { params, peer })
            .map_err(|_| BidiError::transport(StatusCode::Unavailable, "fake server shut down"))?;
        Ok(stream)
    }
}

/// Accepts the streams a session opens
pub struct FakeServer<Req, Resp> {
    connections: mpsc::UnboundedReceiver<Connection<Req, Resp>>,
}

impl<Req, Resp> FakeServer<Req, Resp> {
    pub async fn accept(&mut self) -> Connection<Req, Resp> {
        tokio::time::timeout(STEP_TIMEOUT, self.connections.recv())
            .await
            .expect("timed out waiting for a stream to open")
            .expect("transport dropped")
    }

    /// Assert no stream opens within a short grace period
    pub async fn assert_idle(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(50), self.connections.recv()).await;
        assert!(next.is_err(), "unexpected stream opened");
    }
}

/// Server end of one physical stream
pub struct Connection<Req, Resp> {
    pub params: OpenParams,
    pub peer: StreamPeer<Req, Resp>,
}

impl<Req, Resp> Connection<Req, Resp> {
    pub async fn recv(&mut self) -> Req {
        tokio::time::timeout(STEP_TIMEOUT, self.peer.next_request())
            .await
            .expect("timed out waiting for a request")
            .expect("session closed the stream")
    }

    /// Assert the session sends nothing within a short grace period
    pub async fn assert_quiet(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(50), self.peer.next_request()).await;
        assert!(next.is_err(), "unexpected request on the stream");
    }

    pub fn respond(&self, response: Resp) {
        assert!(self.peer.respond(response), "session dropped the stream");
    }

    pub fn fail(&self, error: TransportError) {
        assert!(self.peer.fail(error), "session dropped the stream");
    }
}

/// Retry settings that reconnect almost immediately
pub fn fast_retry(max_attempts: u32) -> RetrySettings {
    RetrySettings::new()
        .with_max_attempts(max_attempts)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .without_jitter()
}

pub fn test_config() -> BidiConfig {
    BidiConfig::new().with_retry(fast_retry(3))
}

/// Await `future`, failing the test if it stalls
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(STEP_TIMEOUT, future)
        .await
        .expect("operation timed out")
}
