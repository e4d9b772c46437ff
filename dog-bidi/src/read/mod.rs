//! Multiplexed range reads over bidi streams

mod range;
mod session;
mod state;
mod stream;

pub use range::{RangeRead, RangeSpec, RangeStream, ReadMode};
pub use session::ReadSessionMultiplexer;
pub use state::ReadRetryPolicy;

use crate::{BidiTransport, ReadRequest, ReadResponse};

/// Transport carrying read sessions
pub type ReadTransport = dyn BidiTransport<ReadRequest, ReadResponse>;
