use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::state::{AckOutcome, TransferState, WriteState};
use super::WriteTransport;
use crate::{
    BidiConfig, BidiError, BidiResult, BidiStream, BufferPool, ChunkSegmenter, DefaultRetryPolicy,
    ErrorDetail, NewObjectSpec, ObjectName, ObjectResource, PooledBuffer, ResumeSpec,
    RetryContext, RetryDecision, RetryPolicy, Segment, SessionId, StatusCode, StreamEvent,
    TransportError, WriteRequest, WriteResponse,
};

/// Byte sink for one appendable object.
///
/// A background driver task owns the physical stream: it opens it, sends whatever the
/// [`TransferState`] releases, applies responses and reconnects on redirects and retryable
/// failures. Once the session fails every later call returns the same error.
pub struct WriteSessionChannel {
    id: SessionId,
    shared: Arc<WriteShared>,
    segmenter: ChunkSegmenter,
    pool: BufferPool,
    staging: Option<PooledBuffer>,
    finalize_on_close: bool,
    driver: Option<JoinHandle<()>>,
}

struct WriteShared {
    inner: Mutex<WriteInner>,
    /// Bumped whenever offsets or the outcome change
    changed: watch::Sender<u64>,
    /// Wakes the driver when new messages are queued
    wake: Notify,
}

struct WriteInner {
    state: TransferState,
    resource: Option<ObjectResource>,
    failure: Option<BidiError>,
}

enum StreamExit {
    Done,
    Redirected,
    Failed(BidiError),
}

impl WriteSessionChannel {
    /// Start writing a new object. Must be called within a tokio runtime.
    pub fn create(
        transport: Arc<WriteTransport>,
        spec: NewObjectSpec,
        config: BidiConfig,
    ) -> BidiResult<Self> {
        config.validate()?;
        let state = TransferState::new(spec, config.max_pending_bytes, config.finalize_ack_policy);
        let policy = Arc::new(DefaultRetryPolicy::new(config.retry.clone()));
        Self::start(transport, state, config, policy)
    }

    /// Resume appending to an existing object. Writes wait until the server has reported
    /// how many bytes it already holds.
    pub fn takeover(
        transport: Arc<WriteTransport>,
        spec: ResumeSpec,
        config: BidiConfig,
    ) -> BidiResult<Self> {
        config.validate()?;
        let state =
            TransferState::takeover(spec, config.max_pending_bytes, config.finalize_ack_policy);
        let policy = Arc::new(DefaultRetryPolicy::new(config.retry.clone()));
        Self::start(transport, state, config, policy)
    }

    /// Drive `state` with a caller-supplied retry policy
    pub fn start(
        transport: Arc<WriteTransport>,
        state: TransferState,
        config: BidiConfig,
        policy: Arc<dyn RetryPolicy>,
    ) -> BidiResult<Self> {
        config.validate()?;
        let segmenter = ChunkSegmenter::from_rules(&config.segments)?;
        let pool = BufferPool::new(config.staging_buffers, config.segments.min_segment_bytes);

        let id = SessionId::new();
        let object = state.object().clone();
        let (changed, _) = watch::channel(0);
        let shared = Arc::new(WriteShared {
            inner: Mutex::new(WriteInner {
                state,
                resource: None,
                failure: None,
            }),
            changed,
            wake: Notify::new(),
        });

        info!(session = %id, object = %object, "Starting write session");
        let driver = tokio::spawn(run(
            id.clone(),
            object,
            shared.clone(),
            transport,
            RetryContext::new(policy),
            config.max_redirects,
        ));

        Ok(Self {
            id,
            shared,
            segmenter,
            pool,
            staging: None,
            finalize_on_close: config.finalize_on_close,
            driver: Some(driver),
        })
    }

    /// Stage sub-minimum tails in buffers from `pool` instead of a private one
    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> WriteState {
        self.shared.inner.lock().state.state()
    }

    /// Bytes the server has confirmed
    pub fn confirmed(&self) -> u64 {
        self.shared.inner.lock().state.confirmed()
    }

    /// Bytes accepted into the send queue, excluding any staged tail
    pub fn total_sent(&self) -> u64 {
        self.shared.inner.lock().state.total_sent()
    }

    pub fn generation(&self) -> Option<i64> {
        self.shared.inner.lock().state.generation()
    }

    /// Append `data`. Returns once every full segment is queued; a tail shorter than the
    /// minimum segment size is staged until the next write, flush or close.
    pub async fn write(&mut self, data: Bytes) -> BidiResult<usize> {
        let len = data.len();
        self.wait_for(|inner| inner.state.is_reconciled().then_some(()))
            .await?;
        if len == 0 {
            return Ok(0);
        }

        let data = match self.staging.take() {
            Some(mut staged) => {
                staged.extend_from_slice(&data);
                staged.split().freeze()
            }
            None => data,
        };

        let (offset, running) = {
            let inner = self.shared.inner.lock();
            (inner.state.total_sent(), inner.state.cumulative())
        };
        let mut segments = self
            .segmenter
            .segment_at(data, offset, running)
            .hold_short_tail();
        // The last segment of every write asks for an ack so the window keeps draining
        let mut next = segments.next();
        while let Some(segment) = next {
            next = segments.next();
            self.offer(segment, next.is_none()).await?;
        }

        let rest = segments.remainder().clone();
        if !rest.is_empty() {
            let mut buf = self.pool.checkout().await?;
            buf.extend_from_slice(&rest);
            self.staging = Some(buf);
        }
        Ok(len)
    }

    /// Send everything written so far and wait until the server confirms it
    pub async fn flush(&mut self) -> BidiResult<u64> {
        self.send_staged().await?;
        let target = self.shared.inner.lock().state.flush();
        let target = self.fail_on_error(target)?;
        self.shared.wake.notify_one();

        debug!(session = %self.id, target, "Waiting for flush");
        self.wait_for(|inner| inner.state.flushed_to(target).then_some(target))
            .await
    }

    /// Finalize the object and return it as the server reports it. Once finalized, later
    /// calls return the same resource.
    pub async fn finalize_write(&mut self) -> BidiResult<ObjectResource> {
        if let Some(resource) = self.shared.inner.lock().resource.clone() {
            return Ok(resource);
        }
        self.send_staged().await?;
        let finalized = self.shared.inner.lock().state.finalize();
        self.fail_on_error(finalized)?;
        self.shared.wake.notify_one();

        self.wait_for(|inner| inner.resource.clone()).await
    }

    /// Finish the session. Finalizes the object unless the channel was configured to leave
    /// it appendable, in which case everything is flushed and the stream retired.
    pub async fn close(&mut self) -> BidiResult<()> {
        if self.finalize_on_close {
            return self.finalize_write().await.map(|_| ());
        }

        self.flush().await?;
        let retired = self.shared.inner.lock().state.retire();
        self.fail_on_error(retired)?;
        self.shared.wake.notify_one();
        self.shared.publish();
        info!(session = %self.id, "Write session closed without finalizing");
        Ok(())
    }

    /// Abandon the session; pending and later calls fail with [`BidiError::Closed`]
    pub fn abort(&mut self) {
        self.staging = None;
        self.shared.fail_if_running(BidiError::Closed);
    }

    async fn send_staged(&mut self) -> BidiResult<()> {
        let Some(mut staged) = self.staging.take() else {
            return Ok(());
        };
        let data = staged.split().freeze();
        drop(staged);

        let (offset, running) = {
            let inner = self.shared.inner.lock();
            (inner.state.total_sent(), inner.state.cumulative())
        };
        for segment in self.segmenter.segment_at(data, offset, running) {
            self.offer(segment, false).await?;
        }
        Ok(())
    }

    /// Queue one segment. While the unconfirmed window is full, ask the server for an ack
    /// and wait for it.
    async fn offer(&self, segment: Segment, flush: bool) -> BidiResult<()> {
        let mut changed = self.shared.changed.subscribe();
        loop {
            let accepted = {
                let mut inner = self.shared.inner.lock();
                if let Some(err) = &inner.failure {
                    return Err(err.clone());
                }
                let accepted = if flush {
                    inner.state.offer_and_flush(&segment)
                } else {
                    inner.state.offer(&segment)
                };
                match accepted {
                    Ok(false) => inner.state.request_ack().map(|_| false),
                    other => other,
                }
            };
            let accepted = self.fail_on_error(accepted)?;
            self.shared.wake.notify_one();
            if accepted {
                return Ok(());
            }
            changed.changed().await.map_err(|_| BidiError::Closed)?;
        }
    }

    async fn wait_for<T>(&self, mut ready: impl FnMut(&WriteInner) -> Option<T>) -> BidiResult<T> {
        let mut changed = self.shared.changed.subscribe();
        loop {
            {
                let inner = self.shared.inner.lock();
                if let Some(value) = ready(&inner) {
                    return Ok(value);
                }
                if let Some(err) = &inner.failure {
                    return Err(err.clone());
                }
            }
            changed.changed().await.map_err(|_| BidiError::Closed)?;
        }
    }

    /// Surface the stored failure in place of `Invalid` errors raised by a dead session
    fn fail_on_error<T>(&self, result: BidiResult<T>) -> BidiResult<T> {
        result.map_err(|err| self.shared.inner.lock().failure.clone().unwrap_or(err))
    }
}

impl Drop for WriteSessionChannel {
    fn drop(&mut self) {
        self.shared.fail_if_running(BidiError::Closed);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl WriteShared {
    fn publish(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn fail(&self, err: BidiError) {
        {
            let mut inner = self.inner.lock();
            inner.state.terminal_error();
            inner.failure.get_or_insert(err);
        }
        self.wake.notify_one();
        self.publish();
    }

    fn fail_if_running(&self, err: BidiError) {
        let running = !self.inner.lock().state.is_terminal();
        if running {
            self.fail(err);
        }
    }

    fn finish(&self, resource: ObjectResource) {
        self.inner.lock().resource = Some(resource);
        self.publish();
    }
}

#[instrument(skip_all, fields(session = %id, object = %object))]
async fn run(
    id: SessionId,
    object: ObjectName,
    shared: Arc<WriteShared>,
    transport: Arc<WriteTransport>,
    mut retry: RetryContext,
    max_redirects: u32,
) {
    let mut redirects = 0u32;
    loop {
        let params = {
            let mut inner = shared.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state.begin_reconcile();
            inner.state.enqueue_open()
        };

        debug!(params = %params.request_params(), "Opening write stream");
        let failure = match transport.open(params).await {
            Ok(stream) => {
                match pump(&shared, stream, &mut retry, &mut redirects, max_redirects).await {
                    StreamExit::Done => return,
                    StreamExit::Redirected => continue,
                    StreamExit::Failed(err) => err,
                }
            }
            Err(err) => err,
        };

        let ended = {
            let mut inner = shared.inner.lock();
            inner.state.pending_retry();
            inner.state.is_terminal()
        };
        if ended {
            return;
        }

        match retry.record_error(failure) {
            RetryDecision::Retry { backoff, attempt } => {
                warn!(attempt, ?backoff, "Write stream failed, reconnecting");
                shared.publish();
                tokio::time::sleep(backoff).await;
            }
            RetryDecision::GiveUp(err) => {
                error!(%err, "Write session failed");
                shared.fail(err);
                return;
            }
        }
    }
}

async fn pump(
    shared: &WriteShared,
    mut stream: BidiStream<WriteRequest, WriteResponse>,
    retry: &mut RetryContext,
    redirects: &mut u32,
    max_redirects: u32,
) -> StreamExit {
    loop {
        let outbound = {
            let mut inner = shared.inner.lock();
            if inner.state.is_terminal() {
                return StreamExit::Done;
            }
            inner.state.drain()
        };
        for msg in outbound {
            if let Err(err) = stream.send(msg) {
                return StreamExit::Failed(err);
            }
        }

        let event = tokio::select! {
            _ = shared.wake.notified() => continue,
            event = stream.recv() => event,
        };

        match event {
            Some(StreamEvent::Message(response)) => {
                let applied = shared.inner.lock().state.on_response(response);
                match applied {
                    Ok(AckOutcome::Finalized(resource)) => {
                        info!(size = resource.size, generation = resource.generation, "Object finalized");
                        shared.finish(resource);
                        return StreamExit::Done;
                    }
                    Ok(_) => {
                        retry.reset();
                        *redirects = 0;
                        shared.publish();
                    }
                    Err(err) => {
                        error!(%err, "Rejecting write response");
                        shared.fail(err);
                        return StreamExit::Done;
                    }
                }
            }
            Some(StreamEvent::Error(TransportError {
                detail: Some(ErrorDetail::Redirect(info)),
                ..
            })) => {
                *redirects += 1;
                if *redirects > max_redirects {
                    error!(max_redirects, "Redirect limit exceeded");
                    shared.fail(BidiError::RedirectLimit { max: max_redirects });
                    return StreamExit::Done;
                }
                let redirected = shared.inner.lock().state.on_redirect(info);
                if let Err(err) = redirected {
                    error!(%err, "Rejecting redirect");
                    shared.fail(err);
                    return StreamExit::Done;
                }
                debug!(redirects = *redirects, "Write stream redirected");
                return StreamExit::Redirected;
            }
            Some(StreamEvent::Error(err)) => return StreamExit::Failed(err.into()),
            Some(StreamEvent::Complete) | None => {
                return StreamExit::Failed(BidiError::transport(
                    StatusCode::Unavailable,
                    "write stream ended before the session completed",
                ));
            }
        }
    }
}
