use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{BidiError, BidiResult, RangeError, RedirectInfo, StatusCode};

/// Opens physical bidi streams. Implementations bridge an RPC stack to [`BidiStream`].
#[async_trait]
pub trait BidiTransport<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Open a new physical stream
    async fn open(&self, params: OpenParams) -> BidiResult<BidiStream<Req, Resp>>;
}

/// Routing information attached to a stream when it is opened
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenParams {
    pub bucket: String,
    pub routing_token: Option<String>,
    pub appendable: bool,
}

impl OpenParams {
    pub fn new<S: Into<String>>(bucket: S) -> Self {
        Self {
            bucket: bucket.into(),
            routing_token: None,
            appendable: false,
        }
    }

    /// Routing header value, e.g. `bucket=b&appendable=true&routing_token=t`
    pub fn request_params(&self) -> String {
        let mut params = format!("bucket={}", self.bucket);
        if self.appendable {
            params.push_str("&appendable=true");
        }
        if let Some(token) = &self.routing_token {
            params.push_str("&routing_token=");
            params.push_str(token);
        }
        params
    }
}

/// Out-of-band detail attached to a stream error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDetail {
    /// The session moved; reconnect with this context
    Redirect(RedirectInfo),
    /// Failures scoped to individual reads
    ReadRangeErrors(Vec<RangeError>),
}

/// Terminal error of a physical stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub code: StatusCode,
    pub message: String,
    pub detail: Option<ErrorDetail>,
}

impl TransportError {
    pub fn new<S: Into<String>>(code: StatusCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn redirect(info: RedirectInfo) -> Self {
        Self {
            code: StatusCode::Aborted,
            message: "redirect".to_string(),
            detail: Some(ErrorDetail::Redirect(info)),
        }
    }

    pub fn range_errors<S: Into<String>>(code: StatusCode, message: S, errors: Vec<RangeError>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: Some(ErrorDetail::ReadRangeErrors(errors)),
        }
    }
}

impl From<TransportError> for BidiError {
    fn from(err: TransportError) -> Self {
        BidiError::transport(err.code, err.message)
    }
}

/// Inbound event on a physical stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent<T> {
    Message(T),
    Error(TransportError),
    Complete,
}

/// One physical bidi stream as seen by a session
#[derive(Debug)]
pub struct BidiStream<Req, Resp> {
    outbound: mpsc::UnboundedSender<Req>,
    inbound: mpsc::UnboundedReceiver<StreamEvent<Resp>>,
}

impl<Req, Resp> BidiStream<Req, Resp> {
    pub fn new(
        outbound: mpsc::UnboundedSender<Req>,
        inbound: mpsc::UnboundedReceiver<StreamEvent<Resp>>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// In-memory stream plus the peer end a transport or test drives
    pub fn pair() -> (Self, StreamPeer<Req, Resp>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self::new(request_tx, event_rx),
            StreamPeer {
                requests: request_rx,
                events: event_tx,
            },
        )
    }

    /// Queue a message for the peer
    pub fn send(&self, request: Req) -> BidiResult<()> {
        self.outbound
            .send(request)
            .map_err(|_| BidiError::transport(StatusCode::Unavailable, "stream closed by peer"))
    }

    /// Next inbound event; `None` once the peer has gone away
    pub async fn recv(&mut self) -> Option<StreamEvent<Resp>> {
        self.inbound.recv().await
    }
}

/// The far end of an in-memory [`BidiStream`]
#[derive(Debug)]
pub struct StreamPeer<Req, Resp> {
    pub requests: mpsc::UnboundedReceiver<Req>,
    pub events: mpsc::UnboundedSender<StreamEvent<Resp>>,
}

impl<Req, Resp> StreamPeer<Req, Resp> {
    /// Next message sent by the session; `None` once the session dropped the stream
    pub async fn next_request(&mut self) -> Option<Req> {
        self.requests.recv().await
    }

    pub fn respond(&self, response: Resp) -> bool {
        self.events.send(StreamEvent::Message(response)).is_ok()
    }

    pub fn fail(&self, error: TransportError) -> bool {
        self.events.send(StreamEvent::Error(error)).is_ok()
    }

    pub fn complete(&self) -> bool {
        self.events.send(StreamEvent::Complete).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_params() {
        let mut params = OpenParams::new("media");
        assert_eq!(params.request_params(), "bucket=media");

        params.appendable = true;
        params.routing_token = Some("tok".to_string());
        assert_eq!(params.request_params(), "bucket=media&appendable=true&routing_token=tok");
    }

    #[tokio::test]
    async fn test_pair_carries_both_directions() {
        let (mut stream, mut peer) = BidiStream::<u32, &'static str>::pair();

        stream.send(7).unwrap();
        assert_eq!(peer.next_request().await, Some(7));

        assert!(peer.respond("ok"));
        assert_eq!(stream.recv().await, Some(StreamEvent::Message("ok")));

        drop(peer);
        assert_eq!(stream.recv().await, None);
        assert!(stream.send(8).is_err());
    }
}
