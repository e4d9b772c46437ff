//! Protocol messages exchanged over a bidi stream.
//!
//! These are transport-neutral; a transport maps them onto its own RPC types.

use bytes::Bytes;

use crate::{BidiError, BidiResult, ObjectName, ObjectResource, ResumeHandle, StatusCode};

/// Payload bytes with an optional CRC32C of exactly those bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksummedData {
    pub content: Bytes,
    pub crc32c: Option<u32>,
}

impl ChecksummedData {
    pub fn new(content: Bytes, crc32c: Option<u32>) -> Self {
        Self { content, crc32c }
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Create a new appendable object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObjectSpec {
    pub object: ObjectName,
    pub content_type: Option<String>,
    /// Precondition on the existing object's generation; `Some(0)` means must not exist
    pub if_generation_match: Option<i64>,
}

impl NewObjectSpec {
    pub fn new(object: ObjectName) -> Self {
        Self {
            object,
            content_type: None,
            if_generation_match: None,
        }
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_if_generation_match(mut self, generation: i64) -> Self {
        self.if_generation_match = Some(generation);
        self
    }
}

/// Reattach to an existing appendable object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeSpec {
    pub object: ObjectName,
    pub generation: i64,
    pub routing_token: Option<String>,
    pub handle: Option<ResumeHandle>,
}

impl ResumeSpec {
    pub fn new(object: ObjectName, generation: i64) -> Self {
        Self {
            object,
            generation,
            routing_token: None,
            handle: None,
        }
    }
}

/// First message of every write stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenSpec {
    New(NewObjectSpec),
    Resume(ResumeSpec),
}

impl OpenSpec {
    pub fn object(&self) -> &ObjectName {
        match self {
            Self::New(spec) => &spec.object,
            Self::Resume(spec) => &spec.object,
        }
    }
}

/// One outbound write message. Open, data, flush and finish can share a single message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteRequest {
    pub open: Option<OpenSpec>,
    pub write_offset: Option<u64>,
    pub data: Option<ChecksummedData>,
    pub flush: bool,
    pub state_lookup: bool,
    pub finish_write: bool,
    /// CRC32C of the whole object, sent with the finish marker when known
    pub object_crc32c: Option<u32>,
}

impl WriteRequest {
    pub fn open(spec: OpenSpec) -> Self {
        Self {
            open: Some(spec),
            ..Self::default()
        }
    }

    pub fn data(offset: u64, content: Bytes, crc32c: Option<u32>) -> Self {
        Self {
            write_offset: Some(offset),
            data: Some(ChecksummedData::new(content, crc32c)),
            ..Self::default()
        }
    }

    /// Flush marker asking the server to persist and report everything up to `offset`
    pub fn flush_at(offset: u64) -> Self {
        Self {
            write_offset: Some(offset),
            flush: true,
            state_lookup: true,
            ..Self::default()
        }
    }

    /// Ask the server to persist up to the end of this message and report its size
    pub fn with_flush(mut self) -> Self {
        self.flush = true;
        self.state_lookup = true;
        self
    }

    pub fn finish_at(offset: u64, object_crc32c: Option<u32>) -> Self {
        Self {
            write_offset: Some(offset),
            finish_write: true,
            object_crc32c,
            ..Self::default()
        }
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn data_len(&self) -> u64 {
        self.data.as_ref().map_or(0, |d| d.len() as u64)
    }

    /// Object offset just past this message's payload
    pub fn end_offset(&self) -> Option<u64> {
        self.write_offset.map(|offset| offset + self.data_len())
    }

    /// Merge two adjacent messages into one.
    ///
    /// `a`'s payload precedes `b`'s, flags are unioned and the offset is the lower of the
    /// two. Two payloads are never merged, and an open may only lead.
    pub fn concatenate(a: WriteRequest, b: WriteRequest) -> BidiResult<WriteRequest> {
        if a.has_data() && b.has_data() {
            return Err(BidiError::invalid("cannot merge two data messages"));
        }
        if b.open.is_some() {
            return Err(BidiError::invalid("an open must be the first message merged"));
        }
        match (a.write_offset, b.write_offset) {
            (Some(a_offset), Some(b_offset)) if a.has_data() => {
                let a_end = a_offset + a.data_len();
                if a_end != b_offset {
                    return Err(BidiError::invalid(format!(
                        "message at {} does not follow payload ending at {}",
                        b_offset, a_end
                    )));
                }
            }
            (Some(a_offset), Some(b_offset)) if b.has_data() && a_offset != b_offset => {
                return Err(BidiError::invalid(format!(
                    "marker at {} cannot precede payload at {}",
                    a_offset, b_offset
                )));
            }
            _ => {}
        }

        let write_offset = match (a.write_offset, b.write_offset) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (x, y) => x.or(y),
        };

        Ok(WriteRequest {
            open: a.open,
            write_offset,
            data: a.data.or(b.data),
            flush: a.flush || b.flush,
            state_lookup: a.state_lookup || b.state_lookup,
            finish_write: a.finish_write || b.finish_write,
            object_crc32c: b.object_crc32c.or(a.object_crc32c),
        })
    }
}

/// What a write response reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAck {
    PersistedSize(u64),
    Resource(ObjectResource),
}

impl WriteAck {
    pub fn persisted_size(&self) -> u64 {
        match self {
            Self::PersistedSize(size) => *size,
            Self::Resource(resource) => resource.size,
        }
    }

    /// A finalized resource ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resource(resource) if resource.finalized)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {
    pub ack: WriteAck,
    pub write_handle: Option<ResumeHandle>,
}

impl WriteResponse {
    pub fn persisted(size: u64) -> Self {
        Self {
            ack: WriteAck::PersistedSize(size),
            write_handle: None,
        }
    }

    pub fn resource(resource: ObjectResource) -> Self {
        Self {
            ack: WriteAck::Resource(resource),
            write_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: ResumeHandle) -> Self {
        self.write_handle = Some(handle);
        self
    }
}

/// First message of every read stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadObjectSpec {
    pub object: ObjectName,
    pub generation: Option<i64>,
    pub routing_token: Option<String>,
    pub handle: Option<ResumeHandle>,
}

impl ReadObjectSpec {
    pub fn new(object: ObjectName) -> Self {
        Self {
            object,
            generation: None,
            routing_token: None,
            handle: None,
        }
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }
}

/// Ask for `length` bytes at `offset`; a length of zero reads to the end of the object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRangeRequest {
    pub read_id: u64,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadRequest {
    pub open: Option<ReadObjectSpec>,
    pub ranges: Vec<ReadRangeRequest>,
}

impl ReadRequest {
    pub fn ranges(ranges: Vec<ReadRangeRequest>) -> Self {
        Self { open: None, ranges }
    }
}

/// A frame of data for one outstanding read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeData {
    pub read_id: u64,
    pub offset: u64,
    pub data: ChecksummedData,
    /// Last frame of the read
    pub range_end: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResponse {
    pub metadata: Option<ObjectResource>,
    pub read_handle: Option<ResumeHandle>,
    pub ranges: Vec<RangeData>,
}

/// Server failure scoped to a single read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeError {
    pub read_id: u64,
    pub code: StatusCode,
    pub message: String,
}
