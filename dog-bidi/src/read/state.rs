use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::range::{Effect, OutstandingRead, RangeSink, ReadMode};
use crate::{
    BidiError, BidiResult, Checksum, DefaultRetryPolicy, ObjectName, ObjectResource, OpenParams,
    RangeData, RangeError, ReadObjectSpec, ReadRangeRequest, ReadRequest, ReadResponse,
    RedirectInfo, ResumeHandle, RetryDecision, RetryPolicy, RetrySettings, StatusCode,
};

/// Retry policy for single reads: checksum failures and out-of-order frames are retried
/// by re-requesting the undelivered part of the range
#[derive(Debug, Clone)]
pub struct ReadRetryPolicy {
    backoff: DefaultRetryPolicy,
}

impl ReadRetryPolicy {
    pub fn new(settings: RetrySettings, attempts: u32) -> Self {
        Self {
            backoff: DefaultRetryPolicy::new(settings).with_max_attempts(attempts),
        }
    }
}

impl RetryPolicy for ReadRetryPolicy {
    fn is_retryable(&self, error: &BidiError) -> bool {
        matches!(error, BidiError::ChecksumMismatch { .. })
            || matches!(
                error,
                BidiError::RangeFailed {
                    code: StatusCode::OutOfRange,
                    ..
                }
            )
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff.backoff(attempt)
    }

    fn max_attempts(&self) -> u32 {
        self.backoff.max_attempts()
    }
}

/// Reads registered on one physical read stream, plus what it takes to reopen it
#[derive(Debug)]
pub(crate) struct ReadStreamState {
    object: ObjectName,
    generation: Option<i64>,
    routing_token: Option<String>,
    handle: Option<ResumeHandle>,
    metadata: Option<ObjectResource>,
    reads: HashMap<u64, OutstandingRead>,
    read_ids: Arc<AtomicU64>,
    failure: Option<BidiError>,
}

impl ReadStreamState {
    pub(crate) fn new(spec: ReadObjectSpec, read_ids: Arc<AtomicU64>) -> Self {
        Self {
            object: spec.object,
            generation: spec.generation,
            routing_token: spec.routing_token,
            handle: spec.handle,
            metadata: None,
            reads: HashMap::new(),
            read_ids,
            failure: None,
        }
    }

    /// Empty state for a sibling stream on the same object
    pub(crate) fn fork_child(&self) -> Self {
        Self {
            object: self.object.clone(),
            generation: self.generation,
            routing_token: self.routing_token.clone(),
            handle: self.handle.clone(),
            metadata: self.metadata.clone(),
            reads: HashMap::new(),
            read_ids: self.read_ids.clone(),
            failure: None,
        }
    }

    pub(crate) fn metadata(&self) -> Option<&ObjectResource> {
        self.metadata.as_ref()
    }

    pub(crate) fn failure(&self) -> Option<&BidiError> {
        self.failure.as_ref()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.reads.is_empty()
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.reads.len()
    }

    /// A stream serves buffered reads together; a streaming read never shares
    pub(crate) fn can_handle(&self, mode: ReadMode) -> bool {
        mode == ReadMode::Buffered && self.reads.values().all(|r| r.mode == ReadMode::Buffered)
    }

    pub(crate) fn register(&mut self, read: OutstandingRead) {
        debug!(read_id = read.read_id, offset = read.spec.offset, length = read.spec.length, "Registering read");
        self.reads.insert(read.read_id, read);
    }

    /// Open message for a new physical stream. Every read not waiting out a backoff is
    /// re-registered from the bytes it has already received.
    pub(crate) fn open_request(&mut self) -> (OpenParams, ReadRequest) {
        let generation = self
            .metadata
            .as_ref()
            .map(|m| m.generation)
            .or(self.generation);

        let mut ranges: Vec<ReadRangeRequest> = self
            .reads
            .values_mut()
            .filter(|r| !r.in_backoff)
            .map(|r| {
                r.needs_send = false;
                r.request()
            })
            .collect();
        ranges.sort_by_key(|r| r.read_id);

        let spec = ReadObjectSpec {
            object: self.object.clone(),
            generation,
            routing_token: self.routing_token.clone(),
            handle: self.handle.clone(),
        };
        let params = OpenParams {
            bucket: self.object.bucket.clone(),
            routing_token: self.routing_token.clone(),
            appendable: false,
        };
        (
            params,
            ReadRequest {
                open: Some(spec),
                ranges,
            },
        )
    }

    /// Request for a read that has not been sent on the current stream, if any
    pub(crate) fn take_request(&mut self, read_id: u64) -> Option<ReadRangeRequest> {
        let read = self.reads.get_mut(&read_id)?;
        read.in_backoff = false;
        if !read.needs_send {
            return None;
        }
        read.needs_send = false;
        Some(read.request())
    }

    /// Route a response to its reads
    pub(crate) fn on_response(&mut self, response: ReadResponse) -> BidiResult<Vec<Effect>> {
        if let Some(metadata) = response.metadata {
            if let Some(known) = self.generation {
                if known != metadata.generation {
                    return Err(BidiError::data_loss(format!(
                        "object {} changed generation from {} to {}",
                        self.object, known, metadata.generation
                    )));
                }
            }
            self.generation = Some(metadata.generation);
            self.metadata = Some(metadata);
        }
        if let Some(handle) = response.read_handle {
            self.handle = Some(handle);
        }
        self.routing_token = None;

        let mut effects = Vec::new();
        for frame in response.ranges {
            self.on_frame(frame, &mut effects);
        }
        Ok(effects)
    }

    fn on_frame(&mut self, frame: RangeData, effects: &mut Vec<Effect>) {
        let read_id = frame.read_id;
        let Some(read) = self.reads.get_mut(&read_id) else {
            debug!(read_id, "Dropping frame for unknown read");
            return;
        };

        let content = frame.data.content;
        if let Some(expected) = frame.data.crc32c {
            if let Err(actual) = Checksum::validate(expected, &content) {
                let err = BidiError::ChecksumMismatch {
                    read_id,
                    offset: frame.offset,
                    expected,
                    actual,
                };
                self.retry_read(read_id, err, effects);
                return;
            }
        }

        if frame.offset > read.read_offset {
            let err = BidiError::RangeFailed {
                read_id,
                code: StatusCode::OutOfRange,
                message: format!(
                    "frame at offset {} skips ahead of offset {}",
                    frame.offset, read.read_offset
                ),
            };
            self.retry_read(read_id, err, effects);
            return;
        }

        let skip = ((read.read_offset - frame.offset) as usize).min(content.len());
        let mut chunk = content.slice(skip..);
        if let Some(end) = read.spec.end() {
            let room = end.saturating_sub(read.read_offset) as usize;
            chunk.truncate(room);
        }

        if !chunk.is_empty() {
            read.read_offset += chunk.len() as u64;
            read.retry.reset();
            match &mut read.sink {
                RangeSink::Accumulate { chunks, .. } => chunks.push(chunk),
                RangeSink::Stream { tx, .. } => effects.push(Effect::Deliver {
                    tx: tx.clone(),
                    frame: super::range::Frame::Data(chunk),
                }),
            }
        }

        let done = frame.range_end || read.spec.end().is_some_and(|end| read.read_offset >= end);
        if done {
            if let Some(read) = self.reads.remove(&read_id) {
                debug!(read_id, bytes = read.read_offset - read.spec.offset, "Read complete");
                effects.push(read.complete());
            }
        }
    }

    /// Fail the read or re-request what it is missing under a fresh id
    fn retry_read(&mut self, read_id: u64, err: BidiError, effects: &mut Vec<Effect>) {
        let Some(mut read) = self.reads.remove(&read_id) else {
            return;
        };
        match read.retry.record_error(err) {
            RetryDecision::Retry { backoff, attempt } => {
                let new_id = self.read_ids.fetch_add(1, Ordering::Relaxed);
                warn!(
                    read_id,
                    new_id,
                    attempt,
                    offset = read.read_offset,
                    "Re-requesting range after bad frame"
                );
                read.read_id = new_id;
                read.in_backoff = true;
                read.needs_send = true;
                self.reads.insert(new_id, read);
                effects.push(Effect::Resend {
                    read_id: new_id,
                    after: backoff,
                });
            }
            RetryDecision::GiveUp(err) => {
                warn!(read_id, %err, "Read failed");
                effects.push(read.fail(err));
            }
        }
    }

    /// Fail only the reads the server named
    pub(crate) fn on_range_errors(&mut self, errors: Vec<RangeError>) -> Vec<Effect> {
        errors
            .into_iter()
            .filter_map(|e| {
                let read = self.reads.remove(&e.read_id)?;
                warn!(read_id = e.read_id, code = %e.code, "Server failed read");
                Some(read.fail(BidiError::RangeFailed {
                    read_id: e.read_id,
                    code: e.code,
                    message: e.message,
                }))
            })
            .collect()
    }

    /// Merge a server migration signal
    pub(crate) fn on_redirect(&mut self, info: RedirectInfo) -> BidiResult<()> {
        if let (Some(known), Some(redirected)) = (self.generation, info.generation) {
            if known != redirected {
                return Err(BidiError::data_loss(format!(
                    "redirect names generation {} but the session reads generation {}",
                    redirected, known
                )));
            }
        }
        if info.generation.is_some() {
            self.generation = info.generation;
        }
        if info.routing_token.is_some() {
            self.routing_token = info.routing_token;
        }
        if info.handle.is_some() {
            self.handle = info.handle;
        }
        Ok(())
    }

    /// Fail every read and refuse new ones
    pub(crate) fn fail_all(&mut self, err: BidiError) -> Vec<Effect> {
        self.failure.get_or_insert(err.clone());
        self.reads
            .drain()
            .map(|(_, read)| read.fail(err.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::range::RangeSpec;
    use crate::{ChecksummedData, RetryContext};
    use bytes::Bytes;

    fn state() -> ReadStreamState {
        ReadStreamState::new(
            ReadObjectSpec::new(ObjectName::new("bucket", "object")),
            Arc::new(AtomicU64::new(100)),
        )
    }

    fn read_retry(attempts: u32) -> RetryContext {
        RetryContext::new(Arc::new(ReadRetryPolicy::new(
            RetrySettings::new()
                .with_backoff(Duration::from_millis(1), Duration::from_millis(1))
                .without_jitter(),
            attempts,
        )))
    }

    fn frame(read_id: u64, offset: u64, data: &'static [u8], end: bool) -> RangeData {
        RangeData {
            read_id,
            offset,
            data: ChecksummedData::new(Bytes::from_static(data), Some(Checksum::of(data).value())),
            range_end: end,
        }
    }

    fn response(ranges: Vec<RangeData>) -> ReadResponse {
        ReadResponse {
            ranges,
            ..ReadResponse::default()
        }
    }

    fn resolve(effects: Vec<Effect>) {
        for effect in effects {
            effect.apply_now();
        }
    }

    #[tokio::test]
    async fn test_frames_accumulate_until_range_end() {
        let mut state = state();
        let (read, handle) = OutstandingRead::buffered(1, RangeSpec::new(0, 6), read_retry(3));
        state.register(read);

        resolve(state.on_response(response(vec![frame(1, 0, b"abc", false)])).unwrap());
        assert_eq!(state.outstanding(), 1);
        resolve(state.on_response(response(vec![frame(1, 3, b"def", true)])).unwrap());

        assert!(state.is_idle());
        assert_eq!(handle.await.unwrap().as_ref(), b"abcdef");
    }

    #[tokio::test]
    async fn test_overlapping_frame_is_trimmed() {
        let mut state = state();
        let (read, handle) = OutstandingRead::buffered(1, RangeSpec::new(10, 0), read_retry(3));
        state.register(read);

        resolve(state.on_response(response(vec![frame(1, 10, b"abcd", false)])).unwrap());
        resolve(state.on_response(response(vec![frame(1, 12, b"cdef", true)])).unwrap());

        assert_eq!(handle.await.unwrap().as_ref(), b"abcdef");
    }

    #[test]
    fn test_checksum_mismatch_rerequests_remaining_range() {
        let mut state = state();
        let (read, _handle) = OutstandingRead::buffered(1, RangeSpec::new(0, 8), read_retry(3));
        state.register(read);
        resolve(state.on_response(response(vec![frame(1, 0, b"abcd", false)])).unwrap());

        let mut corrupt = frame(1, 4, b"efgh", true);
        corrupt.data.crc32c = Some(0);
        let effects = state.on_response(response(vec![corrupt])).unwrap();

        let new_id = match effects.as_slice() {
            [Effect::Resend { read_id, .. }] => *read_id,
            other => panic!("expected resend, got {:?}", other),
        };
        assert_eq!(new_id, 100);

        let request = state.take_request(new_id).unwrap();
        assert_eq!(request.offset, 4);
        assert_eq!(request.length, 4);
        assert!(state.take_request(new_id).is_none());
    }

    #[tokio::test]
    async fn test_checksum_budget_surfaces_checksum_error() {
        let mut state = state();
        let (read, handle) = OutstandingRead::buffered(1, RangeSpec::new(0, 4), read_retry(2));
        state.register(read);

        let mut corrupt = frame(1, 0, b"abcd", true);
        corrupt.data.crc32c = Some(1);
        let effects = state.on_response(response(vec![corrupt.clone()])).unwrap();
        let retry_id = match effects.as_slice() {
            [Effect::Resend { read_id, .. }] => *read_id,
            other => panic!("expected resend, got {:?}", other),
        };

        corrupt.read_id = retry_id;
        resolve(state.on_response(response(vec![corrupt])).unwrap());

        let err = handle.await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Checksum);
        assert_eq!(err.suppressed().len(), 1);
    }

    #[tokio::test]
    async fn test_range_error_fails_only_named_read() {
        let mut state = state();
        let (a, a_handle) = OutstandingRead::buffered(1, RangeSpec::new(0, 4), read_retry(3));
        let (b, _b_handle) = OutstandingRead::buffered(2, RangeSpec::new(4, 4), read_retry(3));
        state.register(a);
        state.register(b);

        resolve(state.on_range_errors(vec![RangeError {
            read_id: 1,
            code: StatusCode::OutOfRange,
            message: "past end".into(),
        }]));

        assert!(matches!(a_handle.await, Err(BidiError::RangeFailed { read_id: 1, .. })));
        assert_eq!(state.outstanding(), 1);
    }

    #[test]
    fn test_open_request_resumes_at_read_offset() {
        let mut state = state();
        let (read, _handle) = OutstandingRead::buffered(1, RangeSpec::new(0, 10), read_retry(3));
        state.register(read);
        resolve(state.on_response(response(vec![frame(1, 0, b"abc", false)])).unwrap());

        state
            .on_redirect(RedirectInfo::new().with_routing_token("T"))
            .unwrap();
        let (params, request) = state.open_request();

        assert_eq!(params.routing_token.as_deref(), Some("T"));
        assert_eq!(request.open.unwrap().routing_token.as_deref(), Some("T"));
        assert_eq!(
            request.ranges,
            vec![ReadRangeRequest {
                read_id: 1,
                offset: 3,
                length: 7
            }]
        );
    }

    #[test]
    fn test_generation_change_is_data_loss() {
        let mut state = state();
        let metadata = ObjectResource {
            bucket: "bucket".into(),
            name: "object".into(),
            generation: 1,
            size: 10,
            crc32c: None,
            finalized: true,
        };
        state
            .on_response(ReadResponse {
                metadata: Some(metadata.clone()),
                ..ReadResponse::default()
            })
            .unwrap();

        let moved = ObjectResource {
            generation: 2,
            ..metadata
        };
        let err = state
            .on_response(ReadResponse {
                metadata: Some(moved),
                ..ReadResponse::default()
            })
            .unwrap_err();
        assert!(err.is_data_loss());
    }
}
