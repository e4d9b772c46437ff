//! # dog-bidi: Bidirectional streaming engine for blob transfers
//!
//! `dog-bidi` drives large object transfers to and from a blob store over persistent
//! bidirectional streams. It owns the hard parts of the protocol so callers only deal with
//! bytes:
//!
//! ## Key Features
//!
//! - **Chunked appends**: Buffers are cut into bounded, checksummed segments with a running
//!   whole-object CRC that never re-hashes bytes
//! - **Backpressure**: Writers wait once the unconfirmed window is full
//! - **Resumable**: Transport failures and server redirects reconnect transparently and
//!   replay only what the server has not confirmed
//! - **Takeover**: Reattach to an appendable object written by someone else
//! - **Multiplexed reads**: Many range reads share one stream, with per-range checksum
//!   retries and failure isolation
//! - **Transport agnostic**: Bring any RPC stack by implementing [`BidiTransport`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use dog_bidi::prelude::*;
//!
//! # async fn example(
//! #     writes: Arc<WriteTransport>,
//! #     reads: Arc<ReadTransport>,
//! # ) -> BidiResult<()> {
//! let object = ObjectName::new("media", "clips/intro.mp4");
//!
//! // 1. Append and finalize
//! let mut channel = WriteSessionChannel::create(
//!     writes,
//!     NewObjectSpec::new(object.clone()),
//!     BidiConfig::default(),
//! )?;
//! channel.write(Bytes::from_static(b"hello, world")).await?;
//! let resource = channel.finalize_write().await?;
//!
//! // 2. Read ranges back over one stream
//! let session = ReadSessionMultiplexer::open(
//!     reads,
//!     ReadObjectSpec::new(object).with_generation(resource.generation),
//!     BidiConfig::default(),
//! )
//! .await?;
//! let head = session.read_range(0, 5).await?;
//! assert_eq!(head.as_ref(), b"hello");
//! session.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ WriteSessionChannel   ReadSessionMultiplexer │  ← Caller-facing sessions
//! ├──────────────────────────────────────────────┤
//! │ TransferState          per-stream read state │  ← Offsets, queues, routing
//! ├──────────────────────────────────────────────┤
//! │ ChunkSegmenter  Checksum  RetryContext       │  ← Pure building blocks
//! ├──────────────────────────────────────────────┤
//! │ BidiTransport / BidiStream                   │  ← Your RPC stack
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every physical stream is owned by one driver task. Session state lives behind a single
//! lock that only that driver and the session's own calls touch.

mod checksum;
mod config;
mod error;
mod pool;
pub mod read;
mod retry;
mod segment;
mod transport;
mod types;
mod wire;
pub mod write;

// Re-export main types for clean API
pub use checksum::Checksum;
pub use config::{BidiConfig, FinalizeAckPolicy, RetrySettings, SegmentRules};
pub use error::{BidiError, BidiResult, ErrorKind, StatusCode};
pub use pool::{BufferPool, PooledBuffer};
pub use read::{
    RangeRead, RangeSpec, RangeStream, ReadMode, ReadRetryPolicy,
    ReadSessionMultiplexer, ReadTransport,
};
pub use retry::{DefaultRetryPolicy, RetryContext, RetryDecision, RetryPolicy};
pub use segment::{ChunkSegmenter, Segment, Segments};
pub use transport::{
    BidiStream, BidiTransport, ErrorDetail, OpenParams, StreamEvent, StreamPeer, TransportError,
};
pub use types::{ObjectName, ObjectResource, RedirectInfo, ResumeHandle, SessionId};
pub use wire::{
    ChecksummedData, NewObjectSpec, OpenSpec, RangeData, RangeError, ReadObjectSpec,
    ReadRangeRequest, ReadRequest, ReadResponse, ResumeSpec, WriteAck, WriteRequest,
    WriteResponse,
};
pub use write::{AckOutcome, TransferState, WriteSessionChannel, WriteState, WriteTransport};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BidiConfig, BidiError, BidiResult, BidiTransport, ErrorKind, NewObjectSpec, ObjectName,
        ObjectResource, ReadObjectSpec, ReadSessionMultiplexer, ReadTransport, ResumeSpec,
        WriteSessionChannel, WriteTransport,
    };
}
