use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bucket and object name pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectName {
    pub bucket: String,
    pub name: String,
}

impl ObjectName {
    pub fn new<B: Into<String>, N: Into<String>>(bucket: B, name: N) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

/// Opaque server handle that lets a later stream resume an existing session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResumeHandle(pub Bytes);

impl ResumeHandle {
    pub fn new<B: Into<Bytes>>(handle: B) -> Self {
        Self(handle.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Server migration signal for a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectInfo {
    pub routing_token: Option<String>,
    pub handle: Option<ResumeHandle>,
    pub generation: Option<i64>,
}

impl RedirectInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routing_token<S: Into<String>>(mut self, token: S) -> Self {
        self.routing_token = Some(token.into());
        self
    }

    pub fn with_handle(mut self, handle: ResumeHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }
}

/// Object metadata as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectResource {
    pub bucket: String,
    pub name: String,
    pub generation: i64,
    pub size: u64,
    pub crc32c: Option<u32>,
    pub finalized: bool,
}

impl ObjectResource {
    pub fn object_name(&self) -> ObjectName {
        ObjectName::new(self.bucket.clone(), self.name.clone())
    }
}

/// Unique identifier for a write or read session, used in logs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(format!("bidi_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
