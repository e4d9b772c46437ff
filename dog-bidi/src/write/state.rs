use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::{
    BidiError, BidiResult, Checksum, FinalizeAckPolicy, NewObjectSpec, ObjectName,
    ObjectResource, OpenParams, OpenSpec, RedirectInfo, ResumeHandle, ResumeSpec, Segment,
    WriteAck, WriteRequest, WriteResponse,
};

/// Lifecycle of a write session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteState {
    /// Creating a new object; nothing acknowledged yet
    Opening,
    /// Reattaching to an existing object; waiting to learn its persisted size
    Takeover,
    Running,
    /// A flush was requested and not yet confirmed
    FlushPending,
    /// A finish marker is queued
    Finalizing,
    /// The stream failed; no stream is attached
    PendingRetry,
    /// A new stream is attached and only the reconnection message has been sent
    Reconciling,
    Done,
    Failed,
}

impl WriteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// What an accepted response did to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Confirmed bytes moved (or stayed) within the sent window
    Progress { confirmed: u64 },
    /// A reconnection or takeover lookup resolved
    Reconciled { confirmed: u64 },
    /// The object is finalized; the session is done
    Finalized(ObjectResource),
}

/// Offsets, queue and resumption context of one logical upload.
///
/// Survives any number of physical stream reconnects. Every mutation happens under the
/// owning channel's lock, from exactly one stream driver.
#[derive(Debug)]
pub struct TransferState {
    object: ObjectName,
    new_spec: Option<NewObjectSpec>,
    state: WriteState,
    queue: VecDeque<WriteRequest>,
    /// Messages at the head of `queue` already handed to the current stream
    sent: usize,
    max_pending_bytes: u64,
    total_sent: u64,
    confirmed: u64,
    /// Offset of the most recently confirmed data message
    min_byte_offset: u64,
    cumulative: Option<Checksum>,
    generation: Option<i64>,
    routing_token: Option<String>,
    handle: Option<ResumeHandle>,
    takeover_pending: bool,
    finalize_requested: bool,
    flush_target: Option<u64>,
    policy: FinalizeAckPolicy,
    last_resource: Option<ObjectResource>,
}

impl TransferState {
    /// State for a brand new object
    pub fn new(spec: NewObjectSpec, max_pending_bytes: u64, policy: FinalizeAckPolicy) -> Self {
        Self {
            object: spec.object.clone(),
            new_spec: Some(spec),
            state: WriteState::Opening,
            queue: VecDeque::new(),
            sent: 0,
            max_pending_bytes,
            total_sent: 0,
            confirmed: 0,
            min_byte_offset: 0,
            cumulative: Some(Checksum::EMPTY),
            generation: None,
            routing_token: None,
            handle: None,
            takeover_pending: false,
            finalize_requested: false,
            flush_target: None,
            policy,
            last_resource: None,
        }
    }

    /// State for an existing appendable object with no local history
    pub fn takeover(spec: ResumeSpec, max_pending_bytes: u64, policy: FinalizeAckPolicy) -> Self {
        Self {
            object: spec.object,
            new_spec: None,
            state: WriteState::Takeover,
            queue: VecDeque::new(),
            sent: 0,
            max_pending_bytes,
            total_sent: 0,
            confirmed: 0,
            min_byte_offset: 0,
            cumulative: None,
            generation: Some(spec.generation),
            routing_token: spec.routing_token,
            handle: spec.handle,
            takeover_pending: true,
            finalize_requested: false,
            flush_target: None,
            policy,
            last_resource: None,
        }
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn object(&self) -> &ObjectName {
        &self.object
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    /// Bytes enqueued and not yet confirmed
    pub fn pending_bytes(&self) -> u64 {
        self.total_sent - self.confirmed
    }

    pub fn min_byte_offset(&self) -> u64 {
        self.min_byte_offset
    }

    pub fn cumulative(&self) -> Option<Checksum> {
        self.cumulative
    }

    pub fn generation(&self) -> Option<i64> {
        self.generation
    }

    pub fn routing_token(&self) -> Option<&str> {
        self.routing_token.as_deref()
    }

    pub fn handle(&self) -> Option<&ResumeHandle> {
        self.handle.as_ref()
    }

    /// Most recent resource reported by the server
    pub fn last_resource(&self) -> Option<&ObjectResource> {
        self.last_resource.as_ref()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queued messages, head first
    pub fn queued(&self) -> impl Iterator<Item = &WriteRequest> {
        self.queue.iter()
    }

    /// Whether the offsets of the object are known yet
    pub fn is_reconciled(&self) -> bool {
        !self.takeover_pending
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a flush to `target` has been confirmed
    pub fn flushed_to(&self, target: u64) -> bool {
        self.confirmed >= target
    }

    /// Append a segment if the unconfirmed window has room for it.
    ///
    /// Returns `Ok(false)` when the caller has to wait for acknowledgments first.
    pub fn offer(&mut self, segment: &Segment) -> BidiResult<bool> {
        self.append(segment, false)
    }

    /// Like [`offer`](Self::offer), also asking the server to persist and report everything
    /// up to the end of the segment
    pub fn offer_and_flush(&mut self, segment: &Segment) -> BidiResult<bool> {
        self.append(segment, true)
    }

    /// Ask the server to report its persisted size so a full window can drain. No-op while
    /// an unsent request already covers everything sent.
    pub fn request_ack(&mut self) -> BidiResult<()> {
        self.ensure_open_for_data()?;
        let covered = self.queue.len() > self.sent
            && self
                .queue
                .back()
                .is_some_and(|msg| msg.flush && msg.end_offset() == Some(self.total_sent));
        if !covered {
            debug!(object = %self.object, offset = self.total_sent, "Window full, requesting ack");
            self.queue.push_back(WriteRequest::flush_at(self.total_sent));
        }
        Ok(())
    }

    fn append(&mut self, segment: &Segment, flush: bool) -> BidiResult<bool> {
        self.ensure_open_for_data()?;
        if self.takeover_pending {
            return Err(BidiError::invalid("offsets unknown until takeover completes"));
        }
        if segment.offset != self.total_sent {
            return Err(BidiError::invalid(format!(
                "segment at offset {} does not follow {} sent bytes",
                segment.offset, self.total_sent
            )));
        }

        let len = segment.len() as u64;
        if self.pending_bytes() + len > self.max_pending_bytes {
            return Ok(false);
        }

        let mut msg = WriteRequest::data(
            segment.offset,
            segment.bytes.clone(),
            Some(segment.checksum.value()),
        );
        if flush {
            msg = msg.with_flush();
        }
        self.queue.push_back(msg);
        self.total_sent += len;
        self.cumulative = segment.cumulative;
        Ok(true)
    }

    /// Queue a flush marker at the current end of the upload and return its offset
    pub fn flush(&mut self) -> BidiResult<u64> {
        self.ensure_open_for_data()?;
        let target = self.total_sent;
        self.queue.push_back(WriteRequest::flush_at(target));
        self.flush_target = Some(target);
        if !self.is_retrying() && self.state == WriteState::Running {
            self.state = WriteState::FlushPending;
        }
        Ok(target)
    }

    /// Queue the finish marker. Calling it again while finalizing is a no-op.
    pub fn finalize(&mut self) -> BidiResult<u64> {
        if self.state.is_terminal() {
            return Err(BidiError::invalid("session already ended"));
        }
        if self.finalize_requested {
            return Ok(self.total_sent);
        }
        if self.takeover_pending {
            return Err(BidiError::invalid("offsets unknown until takeover completes"));
        }

        self.queue.push_back(WriteRequest::finish_at(
            self.total_sent,
            self.cumulative.map(|c| c.value()),
        ));
        self.finalize_requested = true;
        if !self.is_retrying() && self.state != WriteState::Opening {
            self.state = WriteState::Finalizing;
        }
        Ok(self.total_sent)
    }

    /// End the session without finalizing once everything sent is confirmed
    pub fn retire(&mut self) -> BidiResult<()> {
        if self.confirmed != self.total_sent {
            return Err(BidiError::invalid(format!(
                "{} of {} bytes still unconfirmed",
                self.total_sent - self.confirmed,
                self.total_sent
            )));
        }
        self.queue.clear();
        self.sent = 0;
        self.state = WriteState::Done;
        Ok(())
    }

    /// Put the reconnection message at the head of the queue and describe the stream to
    /// open for it.
    pub fn enqueue_open(&mut self) -> OpenParams {
        self.queue.retain(|msg| msg.open.is_none());

        let mut open = match self.generation {
            Some(generation) => {
                let mut spec = ResumeSpec::new(self.object.clone(), generation);
                spec.routing_token = self.routing_token.clone();
                spec.handle = self.handle.clone();
                WriteRequest::open(OpenSpec::Resume(spec))
            }
            None => {
                let spec = self
                    .new_spec
                    .clone()
                    .unwrap_or_else(|| NewObjectSpec::new(self.object.clone()));
                WriteRequest::open(OpenSpec::New(spec))
            }
        };
        open.state_lookup = self.generation.is_some();
        self.queue.push_front(open);
        self.sent = 0;

        OpenParams {
            bucket: self.object.bucket.clone(),
            routing_token: self.routing_token.clone(),
            appendable: true,
        }
    }

    /// Take the messages not yet handed to the current stream, merging neighbours where
    /// it is safe.
    ///
    /// While a reconnection is unresolved only the reconnection message is released.
    pub fn drain(&mut self) -> Vec<WriteRequest> {
        match self.state {
            WriteState::Done | WriteState::Failed | WriteState::PendingRetry => return Vec::new(),
            WriteState::Reconciling | WriteState::Takeover => {
                if self.sent == 0 {
                    if let Some(open) = self.queue.front().filter(|m| m.open.is_some()) {
                        self.sent = 1;
                        return vec![open.clone()];
                    }
                }
                return Vec::new();
            }
            _ => {}
        }

        let mut out = Vec::new();
        let mut current: Option<WriteRequest> = None;
        for msg in self.queue.iter().skip(self.sent) {
            current = match current.take() {
                None => Some(msg.clone()),
                Some(cur) => {
                    let open_only = cur.open.is_some() && cur.write_offset.is_none();
                    if !msg.has_data() || open_only {
                        match WriteRequest::concatenate(cur.clone(), msg.clone()) {
                            Ok(merged) => Some(merged),
                            Err(_) => {
                                out.push(cur);
                                Some(msg.clone())
                            }
                        }
                    } else {
                        out.push(cur);
                        Some(msg.clone())
                    }
                }
            };
        }
        out.extend(current);
        self.sent = self.queue.len();
        out
    }

    /// Apply a server response.
    ///
    /// On error nothing is changed; the caller decides whether the session fails.
    pub fn on_response(&mut self, response: WriteResponse) -> BidiResult<AckOutcome> {
        if self.state.is_terminal() {
            return Err(BidiError::invalid("response after session ended"));
        }
        let persisted = response.ack.persisted_size();
        let terminal = response.ack.is_terminal();
        let resource = match &response.ack {
            WriteAck::Resource(resource) => Some(resource.clone()),
            WriteAck::PersistedSize(_) => None,
        };

        if self.takeover_pending {
            if terminal {
                return Err(BidiError::invalid(format!(
                    "object {} is already finalized",
                    self.object
                )));
            }
            self.capture(&response, resource.as_ref());
            self.total_sent = persisted;
            self.confirmed = persisted;
            self.min_byte_offset = persisted;
            self.cumulative = match resource.as_ref().and_then(|r| r.crc32c) {
                Some(crc) => Some(Checksum::new(crc, persisted)),
                None if persisted == 0 => Some(Checksum::EMPTY),
                None => None,
            };
            self.takeover_pending = false;
            self.evict(persisted);
            self.state = self.settled_state();
            debug!(object = %self.object, persisted, "Takeover reconciled");
            return Ok(AckOutcome::Reconciled { confirmed: persisted });
        }

        if persisted > self.total_sent {
            return Err(BidiError::data_loss(format!(
                "server reports {} persisted bytes but only {} were sent",
                persisted, self.total_sent
            )));
        }
        if persisted < self.confirmed {
            return Err(BidiError::data_loss(format!(
                "server reports {} persisted bytes after confirming {}",
                persisted, self.confirmed
            )));
        }

        if terminal {
            if !self.finalize_requested {
                return Err(BidiError::data_loss(format!(
                    "object finalized at {} bytes before finish was requested",
                    persisted
                )));
            }
            if persisted != self.total_sent {
                let accept = self.policy == FinalizeAckPolicy::AcceptBuffered
                    && persisted > self.min_byte_offset;
                if !accept {
                    return Err(BidiError::data_loss(format!(
                        "object finalized with {} bytes but {} were sent",
                        persisted, self.total_sent
                    )));
                }
                warn!(
                    object = %self.object,
                    persisted,
                    total_sent = self.total_sent,
                    "Short finalize ack accepted as progress"
                );
                self.capture(&response, resource.as_ref());
                self.confirmed = persisted;
                self.evict(persisted);
                self.routing_token = None;
                return Ok(AckOutcome::Progress { confirmed: persisted });
            }
            return self.complete(response, resource);
        }

        let was = self.state;
        self.capture(&response, resource.as_ref());
        self.confirmed = persisted;
        self.evict(persisted);
        self.routing_token = None;
        if self.flush_target.is_some_and(|target| persisted >= target) {
            self.flush_target = None;
        }
        self.state = self.settled_state();

        if was == WriteState::Reconciling {
            debug!(object = %self.object, confirmed = persisted, "Reconnection reconciled");
            Ok(AckOutcome::Reconciled { confirmed: persisted })
        } else {
            Ok(AckOutcome::Progress { confirmed: persisted })
        }
    }

    /// Merge a server migration signal and detach from the current stream
    pub fn on_redirect(&mut self, info: RedirectInfo) -> BidiResult<()> {
        if let (Some(known), Some(redirected)) = (self.generation, info.generation) {
            if known != redirected {
                return Err(BidiError::data_loss(format!(
                    "redirect names generation {} but the session writes generation {}",
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
        self.pending_retry();
        Ok(())
    }

    /// The current stream is gone
    pub fn pending_retry(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = WriteState::PendingRetry;
        self.sent = 0;
    }

    /// A new stream is about to be opened
    pub fn begin_reconcile(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.sent = 0;
        self.state = if self.takeover_pending {
            WriteState::Takeover
        } else if self.generation.is_none() {
            WriteState::Opening
        } else {
            WriteState::Reconciling
        };
    }

    /// The session failed for good
    pub fn terminal_error(&mut self) {
        self.state = WriteState::Failed;
        self.queue.clear();
        self.sent = 0;
    }

    fn complete(
        &mut self,
        response: WriteResponse,
        resource: Option<ObjectResource>,
    ) -> BidiResult<AckOutcome> {
        let mut resource = resource
            .ok_or_else(|| BidiError::data_loss("terminal ack without a resource"))?;

        let local = self.cumulative.map(|c| c.value());
        if let (Some(local), Some(remote)) = (local, resource.crc32c) {
            if local != remote {
                return Err(BidiError::data_loss(format!(
                    "object checksum {:#010x} does not match written bytes {:#010x}",
                    remote, local
                )));
            }
        }

        self.capture(&response, Some(&resource));
        self.confirmed = self.total_sent;
        resource.size = self.confirmed;
        resource.crc32c = local.or(resource.crc32c);
        self.queue.clear();
        self.sent = 0;
        self.state = WriteState::Done;
        Ok(AckOutcome::Finalized(resource))
    }

    fn capture(&mut self, response: &WriteResponse, resource: Option<&ObjectResource>) {
        if let Some(handle) = &response.write_handle {
            self.handle = Some(handle.clone());
        }
        if let Some(resource) = resource {
            if self.generation.is_none() {
                self.generation = Some(resource.generation);
            }
            self.last_resource = Some(resource.clone());
        }
    }

    fn evict(&mut self, persisted: u64) {
        let mut evicted = 0;
        while let Some(head) = self.queue.front() {
            let done = if head.has_data() {
                let offset = head.write_offset.unwrap_or(0);
                let end = offset + head.data_len();
                if end <= persisted {
                    self.min_byte_offset = offset;
                    true
                } else {
                    false
                }
            } else if head.open.is_some() {
                true
            } else if head.finish_write {
                false
            } else {
                head.write_offset.map_or(true, |offset| offset <= persisted)
            };
            if !done {
                break;
            }
            self.queue.pop_front();
            evicted += 1;
        }
        self.sent = self.sent.saturating_sub(evicted);
    }

    fn settled_state(&self) -> WriteState {
        if self.finalize_requested {
            WriteState::Finalizing
        } else if self.flush_target.is_some() {
            WriteState::FlushPending
        } else {
            WriteState::Running
        }
    }

    fn is_retrying(&self) -> bool {
        matches!(
            self.state,
            WriteState::PendingRetry | WriteState::Reconciling | WriteState::Takeover
        )
    }

    fn ensure_open_for_data(&self) -> BidiResult<()> {
        if self.state.is_terminal() {
            return Err(BidiError::invalid("session already ended"));
        }
        if self.finalize_requested {
            return Err(BidiError::invalid("session is finalizing"));
        }
        Ok(())
    }
}
