use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument};

use super::range::{OutstandingRead, RangeRead, RangeSpec, RangeStream, ReadMode};
use super::state::{ReadRetryPolicy, ReadStreamState};
use super::stream::{ReadStreamHandle, StreamContext};
use super::ReadTransport;
use crate::{
    BidiConfig, BidiError, BidiResult, DefaultRetryPolicy, ObjectResource, ReadObjectSpec,
    RetryContext, RetryPolicy, SessionId,
};

/// Chunks buffered per streaming read before its stream stops reading
const STREAM_READ_BUFFER: usize = 16;

/// Serves many range reads of one object.
///
/// Buffered reads share one physical stream and are told apart by read id. A streaming
/// read gets a stream of its own so a slow consumer never holds up its siblings.
pub struct ReadSessionMultiplexer {
    id: SessionId,
    ctx: Arc<StreamContext>,
    root: ReadStreamHandle,
    children: Mutex<Vec<ReadStreamHandle>>,
    read_ids: Arc<AtomicU64>,
    read_retry: Arc<dyn RetryPolicy>,
    metadata: ObjectResource,
    closed: AtomicBool,
}

impl ReadSessionMultiplexer {
    /// Open a session and wait for the object's metadata
    pub async fn open(
        transport: Arc<ReadTransport>,
        spec: ReadObjectSpec,
        config: BidiConfig,
    ) -> BidiResult<Self> {
        let policy = Arc::new(DefaultRetryPolicy::new(config.retry.clone()));
        Self::open_with_policy(transport, spec, config, policy).await
    }

    /// Open with a caller-supplied stream retry policy
    #[instrument(skip_all, fields(object = %spec.object))]
    pub async fn open_with_policy(
        transport: Arc<ReadTransport>,
        spec: ReadObjectSpec,
        config: BidiConfig,
        policy: Arc<dyn RetryPolicy>,
    ) -> BidiResult<Self> {
        config.validate()?;
        let id = SessionId::new();
        let ctx = Arc::new(StreamContext {
            session: id.clone(),
            transport,
            policy,
            max_redirects: config.max_redirects,
        });

        let read_ids = Arc::new(AtomicU64::new(1));
        let state = ReadStreamState::new(spec, read_ids.clone());
        let (ready_tx, ready_rx) = oneshot::channel();
        let root = ReadStreamHandle::spawn(ctx.clone(), state, Some(ready_tx), false);

        let metadata = match ready_rx.await {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(err)) => {
                root.shutdown(err.clone());
                return Err(err);
            }
            Err(_) => {
                root.shutdown(BidiError::Closed);
                return Err(BidiError::Closed);
            }
        };
        info!(session = %id, generation = metadata.generation, size = metadata.size, "Read session open");

        Ok(Self {
            id,
            ctx,
            root,
            children: Mutex::new(Vec::new()),
            read_ids,
            read_retry: Arc::new(ReadRetryPolicy::new(config.retry.clone(), config.read_attempts)),
            metadata,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Latest object metadata reported on the session's main stream
    pub fn metadata(&self) -> ObjectResource {
        self.root
            .state
            .lock()
            .metadata()
            .cloned()
            .unwrap_or_else(|| self.metadata.clone())
    }

    /// Physical streams currently serving reads, the main stream included
    pub fn stream_count(&self) -> usize {
        let mut children = self.children.lock();
        children.retain(|child| !child.is_finished());
        1 + children.len()
    }

    /// Read `length` bytes at `offset` (zero reads to the end of the object), resolving
    /// once the whole range has arrived
    pub fn read_range(&self, offset: u64, length: u64) -> RangeRead {
        let read_id = self.next_read_id();
        if self.is_closed() {
            return RangeRead::failed(read_id, BidiError::Closed);
        }

        let (read, handle) = OutstandingRead::buffered(
            read_id,
            RangeSpec::new(offset, length),
            RetryContext::new(self.read_retry.clone()),
        );

        let rejected = {
            let mut state = self.root.state.lock();
            if let Some(err) = state.failure().cloned() {
                Some((read, err))
            } else if state.can_handle(ReadMode::Buffered) {
                state.register(read);
                None
            } else {
                drop(state);
                self.fork(read);
                return handle;
            }
        };

        match rejected {
            Some((read, err)) => read.fail(err).apply_now(),
            None => {
                if !self.root.send(read_id) {
                    debug!(read_id, "Main read stream is gone");
                }
            }
        }
        handle
    }

    /// Stream `length` bytes at `offset` (zero reads to the end of the object) chunk by
    /// chunk over a dedicated physical stream
    pub fn read_range_stream(&self, offset: u64, length: u64) -> RangeStream {
        let read_id = self.next_read_id();
        if self.is_closed() {
            return RangeStream::failed(read_id, BidiError::Closed);
        }

        let (read, stream) = OutstandingRead::streaming(
            read_id,
            RangeSpec::new(offset, length),
            RetryContext::new(self.read_retry.clone()),
            STREAM_READ_BUFFER,
        );
        self.fork(read);
        stream
    }

    /// Fail every outstanding read with [`BidiError::Closed`] and stop all streams
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session = %self.id, "Closing read session");
        self.root.shutdown(BidiError::Closed);
        for child in self.children.lock().drain(..) {
            child.shutdown(BidiError::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_read_id(&self) -> u64 {
        self.read_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Serve `read` on a new physical stream that retires once the read is done
    fn fork(&self, read: OutstandingRead) {
        let read_id = read.read_id;
        let mut state = self.root.state.lock().fork_child();
        state.register(read);
        debug!(session = %self.id, read_id, "Forking read stream");

        let child = ReadStreamHandle::spawn(self.ctx.clone(), state, None, true);
        let mut children = self.children.lock();
        children.retain(|c| !c.is_finished());
        children.push(child);
    }
}

impl Drop for ReadSessionMultiplexer {
    fn drop(&mut self) {
        self.close();
    }
}
