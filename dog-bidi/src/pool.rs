use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{BidiError, BidiResult};

/// Fixed-capacity pool of staging buffers.
///
/// A checkout holds one permit until the returned [`PooledBuffer`] is dropped, whatever the
/// exit path.
#[derive(Debug, Clone)]
pub struct BufferPool {
    permits: Arc<Semaphore>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            buffer_size,
        }
    }

    /// Wait for a free buffer
    pub async fn checkout(&self) -> BidiResult<PooledBuffer> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BidiError::Closed)?;
        Ok(self.wrap(permit))
    }

    /// Take a buffer only if one is free right now
    pub fn try_checkout(&self) -> Option<PooledBuffer> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.wrap(permit))
    }

    /// Buffers not currently checked out
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Reject further checkouts; buffers already out stay valid
    pub fn close(&self) {
        self.permits.close();
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> PooledBuffer {
        PooledBuffer {
            buf: BytesMut::with_capacity(self.buffer_size),
            _permit: permit,
        }
    }
}

/// A checked-out buffer; returns its slot to the pool on drop
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}
