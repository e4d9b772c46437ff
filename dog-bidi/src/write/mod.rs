//! Appendable object uploads over a bidi stream

mod channel;
mod state;

pub use channel::WriteSessionChannel;
pub use state::{AckOutcome, TransferState, WriteState};

use crate::{BidiTransport, WriteRequest, WriteResponse};

/// Transport carrying write sessions
pub type WriteTransport = dyn BidiTransport<WriteRequest, WriteResponse>;
