use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{BidiError, BidiResult, ReadRangeRequest, RetryContext};

/// How a read hands data to its consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadMode {
    /// Accumulate the whole range, then resolve a future
    Buffered,
    /// Yield chunks through a bounded channel as they arrive
    Streaming,
}

/// Requested byte range; a length of zero reads to the end of the object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub offset: u64,
    pub length: u64,
}

impl RangeSpec {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset, if bounded
    pub fn end(&self) -> Option<u64> {
        (self.length > 0).then(|| self.offset + self.length)
    }
}

/// Item flowing to a streaming read
#[derive(Debug)]
pub(crate) enum Frame {
    Data(Bytes),
    End,
    Failed(BidiError),
}

#[derive(Debug)]
pub(crate) enum RangeSink {
    Accumulate {
        chunks: Vec<Bytes>,
        tx: oneshot::Sender<BidiResult<Bytes>>,
    },
    Stream {
        tx: mpsc::Sender<Frame>,
        /// Terminal error, readable even when the channel was too full to carry it
        failure: Arc<Mutex<Option<BidiError>>>,
    },
}

/// Side effect produced under the stream lock and carried out after releasing it
#[derive(Debug)]
pub(crate) enum Effect {
    Resolve {
        tx: oneshot::Sender<BidiResult<Bytes>>,
        result: BidiResult<Bytes>,
    },
    Deliver {
        tx: mpsc::Sender<Frame>,
        frame: Frame,
    },
    /// Send the read again once its backoff elapsed
    Resend { read_id: u64, after: std::time::Duration },
}

impl Effect {
    /// Carry out without waiting. A frame that does not fit a full streaming channel is
    /// dropped; a failure still reaches the consumer through the sink's failure slot.
    pub(crate) fn apply_now(self) {
        match self {
            Effect::Resolve { tx, result } => {
                let _ = tx.send(result);
            }
            Effect::Deliver { tx, frame } => {
                let _ = tx.try_send(frame);
            }
            Effect::Resend { .. } => {}
        }
    }
}

/// A read registered on a physical stream
#[derive(Debug)]
pub(crate) struct OutstandingRead {
    pub(crate) read_id: u64,
    pub(crate) spec: RangeSpec,
    /// Next object offset expected for this read
    pub(crate) read_offset: u64,
    pub(crate) mode: ReadMode,
    pub(crate) sink: RangeSink,
    pub(crate) retry: RetryContext,
    pub(crate) in_backoff: bool,
    pub(crate) needs_send: bool,
}

impl OutstandingRead {
    pub(crate) fn buffered(read_id: u64, spec: RangeSpec, retry: RetryContext) -> (Self, RangeRead) {
        let (tx, rx) = oneshot::channel();
        let read = Self::with_sink(
            read_id,
            spec,
            retry,
            ReadMode::Buffered,
            RangeSink::Accumulate {
                chunks: Vec::new(),
                tx,
            },
        );
        (read, RangeRead { read_id, rx })
    }

    pub(crate) fn streaming(
        read_id: u64,
        spec: RangeSpec,
        retry: RetryContext,
        capacity: usize,
    ) -> (Self, RangeStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let failure = Arc::new(Mutex::new(None));
        let sink = RangeSink::Stream {
            tx,
            failure: failure.clone(),
        };
        let read = Self::with_sink(read_id, spec, retry, ReadMode::Streaming, sink);
        (
            read,
            RangeStream {
                read_id,
                rx,
                failure,
                done: false,
            },
        )
    }

    fn with_sink(
        read_id: u64,
        spec: RangeSpec,
        retry: RetryContext,
        mode: ReadMode,
        sink: RangeSink,
    ) -> Self {
        Self {
            read_id,
            spec,
            read_offset: spec.offset,
            mode,
            sink,
            retry,
            in_backoff: false,
            needs_send: true,
        }
    }

    /// Request for whatever this read has not received yet
    pub(crate) fn request(&self) -> ReadRangeRequest {
        let length = match self.spec.end() {
            Some(end) => end - self.read_offset,
            None => 0,
        };
        ReadRangeRequest {
            read_id: self.read_id,
            offset: self.read_offset,
            length,
        }
    }

    pub(crate) fn complete(self) -> Effect {
        match self.sink {
            RangeSink::Accumulate { chunks, tx } => Effect::Resolve {
                tx,
                result: Ok(concat(chunks)),
            },
            RangeSink::Stream { tx, .. } => Effect::Deliver {
                tx,
                frame: Frame::End,
            },
        }
    }

    pub(crate) fn fail(self, err: BidiError) -> Effect {
        match self.sink {
            RangeSink::Accumulate { tx, .. } => Effect::Resolve { tx, result: Err(err) },
            RangeSink::Stream { tx, failure } => {
                failure.lock().get_or_insert_with(|| err.clone());
                Effect::Deliver {
                    tx,
                    frame: Frame::Failed(err),
                }
            }
        }
    }
}

fn concat(mut chunks: Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.pop().unwrap_or_default(),
        _ => {
            let len = chunks.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(len);
            for chunk in chunks {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        }
    }
}

/// Future resolving with the whole requested range
#[derive(Debug)]
pub struct RangeRead {
    read_id: u64,
    rx: oneshot::Receiver<BidiResult<Bytes>>,
}

impl RangeRead {
    /// Already-failed read, for sessions that can no longer accept work
    pub(crate) fn failed(read_id: u64, err: BidiError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { read_id, rx }
    }

    /// Id the read was registered with
    pub fn read_id(&self) -> u64 {
        self.read_id
    }
}

impl Future for RangeRead {
    type Output = BidiResult<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(BidiError::Closed)))
    }
}

/// Chunks of the requested range in object order.
///
/// Ends with `None` after the last chunk; a failure is yielded once as `Some(Err(_))`.
#[derive(Debug)]
pub struct RangeStream {
    read_id: u64,
    rx: mpsc::Receiver<Frame>,
    failure: Arc<Mutex<Option<BidiError>>>,
    done: bool,
}

impl RangeStream {
    pub(crate) fn failed(read_id: u64, err: BidiError) -> Self {
        let (_, rx) = mpsc::channel(1);
        Self {
            read_id,
            rx,
            failure: Arc::new(Mutex::new(Some(err))),
            done: false,
        }
    }

    pub fn read_id(&self) -> u64 {
        self.read_id
    }

    /// Next chunk, `None` once the range is complete
    pub async fn next_chunk(&mut self) -> Option<BidiResult<Bytes>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Collect the remaining chunks
    pub async fn read_to_end(mut self) -> BidiResult<Bytes> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            chunks.push(chunk?);
        }
        Ok(concat(chunks))
    }
}

impl Stream for RangeStream {
    type Item = BidiResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Frame::Data(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Frame::End)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Frame::Failed(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.done = true;
                let err = self.failure.lock().take().unwrap_or(BidiError::Closed);
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultRetryPolicy, RetryPolicy};

    fn retry() -> RetryContext {
        let policy: Arc<dyn RetryPolicy> = Arc::new(DefaultRetryPolicy::default());
        RetryContext::new(policy)
    }

    #[test]
    fn test_request_covers_remaining_bytes() {
        let (mut read, _handle) = OutstandingRead::buffered(1, RangeSpec::new(100, 50), retry());
        read.read_offset = 120;

        let request = read.request();

        assert_eq!(request.offset, 120);
        assert_eq!(request.length, 30);
    }

    #[test]
    fn test_unbounded_request_stays_unbounded() {
        let (mut read, _handle) = OutstandingRead::buffered(1, RangeSpec::new(0, 0), retry());
        read.read_offset = 64;

        assert_eq!(read.request().length, 0);
    }

    #[tokio::test]
    async fn test_dropped_sink_resolves_closed() {
        let (read, handle) = OutstandingRead::buffered(4, RangeSpec::new(0, 10), retry());
        drop(read);

        assert!(matches!(handle.await, Err(BidiError::Closed)));
    }

    #[tokio::test]
    async fn test_stream_without_end_marker_is_closed() {
        let (read, mut stream) = OutstandingRead::streaming(5, RangeSpec::new(0, 0), retry(), 4);
        if let RangeSink::Stream { tx, .. } = &read.sink {
            tx.send(Frame::Data(Bytes::from_static(b"abc"))).await.unwrap();
        }
        drop(read);

        assert_eq!(stream.next_chunk().await.unwrap().unwrap().as_ref(), b"abc");
        assert!(matches!(stream.next_chunk().await, Some(Err(BidiError::Closed))));
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_reaches_consumer_behind_full_channel() {
        let (read, mut stream) = OutstandingRead::streaming(7, RangeSpec::new(0, 0), retry(), 1);
        if let RangeSink::Stream { tx, .. } = &read.sink {
            tx.try_send(Frame::Data(Bytes::from_static(b"abc"))).unwrap();
        }

        read.fail(BidiError::data_loss("generation changed")).apply_now();

        assert_eq!(stream.next_chunk().await.unwrap().unwrap().as_ref(), b"abc");
        let err = stream.next_chunk().await.unwrap().unwrap_err();
        assert!(err.is_data_loss());
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_completed_read_concatenates_chunks() {
        let (mut read, handle) = OutstandingRead::buffered(6, RangeSpec::new(0, 6), retry());
        if let RangeSink::Accumulate { chunks, .. } = &mut read.sink {
            chunks.push(Bytes::from_static(b"abc"));
            chunks.push(Bytes::from_static(b"def"));
        }

        read.complete().apply_now();

        assert_eq!(handle.await.unwrap().as_ref(), b"abcdef");
    }
}
