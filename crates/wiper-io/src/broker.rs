//! Aggregation service collaborator: named-signal values, call contexts and
//! the streaming subscribe / bulk upsert client trait.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use wiper_core::{DataType, Signal};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DatapointValue {
    String(String),
    Bool(bool),
    Uint32(u32),
    Float(f32),
    NotAvailable,
}

impl DatapointValue {
    pub fn kind(&self) -> &'static str {
        match self {
            DatapointValue::String(_) => "string",
            DatapointValue::Bool(_) => "bool",
            DatapointValue::Uint32(_) => "uint32",
            DatapointValue::Float(_) => "float",
            DatapointValue::NotAvailable => "not_available",
        }
    }
}

impl fmt::Display for DatapointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatapointValue::String(v) => write!(f, "'{v}'"),
            DatapointValue::Bool(v) => write!(f, "{v}"),
            DatapointValue::Uint32(v) => write!(f, "{v}"),
            DatapointValue::Float(v) => write!(f, "{v}"),
            DatapointValue::NotAvailable => f.write_str("N/A"),
        }
    }
}

/// Path -> value, ordered by path.
pub type UpdateBatch = BTreeMap<String, DatapointValue>;

/// Wiper signals are all registered as on-change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    OnChange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatapointMetadata {
    pub path: String,
    pub data_type: DataType,
    pub change_type: ChangeType,
    pub description: String,
}

impl DatapointMetadata {
    pub fn for_signal(signal: &Signal, root: &str) -> Self {
        Self {
            path: signal.path(root),
            data_type: signal.data_type,
            change_type: ChangeType::OnChange,
            description: signal.description.to_string(),
        }
    }
}

/// Terminal status of an RPC, mirroring the gRPC code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Codes after which reconnecting cannot succeed without operator action.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            StatusCode::Unauthenticated | StatusCode::Unimplemented | StatusCode::Internal
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    pub code: StatusCode,
    pub message: String,
}

impl StreamStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(StatusCode::Cancelled, "call cancelled")
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Update(UpdateBatch),
    End(StreamStatus),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("rpc failed with {0}")]
    Rpc(StreamStatus),
    #[error("aggregation service at {0} is unavailable")]
    Unavailable(String),
}

type CancelHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CallState {
    cancelled: bool,
    hooks: Vec<CancelHook>,
    metadata: Vec<(String, String)>,
}

/// Handle to one RPC. Clones share cancellation state.
#[derive(Clone, Default)]
pub struct CallContext {
    state: Arc<Mutex<CallState>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_metadata(self, key: &str, value: &str) -> Self {
        self.lock()
            .metadata
            .push((key.to_string(), value.to_string()));
        self
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        self.lock()
            .metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Cancels the call. Registered hooks run once, outside the lock.
    pub fn cancel(&self) {
        let hooks = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Registers work to run on cancellation; runs immediately if already cancelled.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        if state.cancelled {
            drop(state);
            hook();
        } else {
            state.hooks.push(Box::new(hook));
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CallContext")
            .field("cancelled", &state.cancelled)
            .field("hooks", &state.hooks.len())
            .finish()
    }
}

/// Server-streaming reader. `read` blocks until an update arrives or the
/// stream ends; after an `End` every further read returns `End` again.
pub trait StreamReader: Send {
    fn read(&mut self) -> StreamItem;
}

/// Signal aggregation service as seen by the adapter.
pub trait AggregationClient: Send + Sync {
    fn address(&self) -> &str;
    /// Blocks until the channel is ready or `deadline` passes.
    fn wait_for_connected(&self, deadline: Instant) -> bool;
    fn create_call_context(&self) -> CallContext;
    /// Opens a stream of actuator target updates for `paths`.
    fn open_subscribe_stream(&self, ctx: &CallContext, paths: &[String]) -> Box<dyn StreamReader>;
    fn register_datapoints(&self, metadata: &[DatapointMetadata]) -> Result<(), BrokerError>;
    fn update_datapoints(&self, batch: &UpdateBatch) -> Result<(), BrokerError>;
}

/// Formats a token as the authorization metadata value.
pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fatal_codes() {
        assert!(StatusCode::Unauthenticated.is_fatal());
        assert!(StatusCode::Unimplemented.is_fatal());
        assert!(StatusCode::Internal.is_fatal());
        assert!(!StatusCode::Unavailable.is_fatal());
        assert!(!StatusCode::Unknown.is_fatal());
        assert!(!StatusCode::Ok.is_fatal());
        assert!(!StatusCode::Cancelled.is_fatal());
    }

    #[test]
    fn cancel_runs_hooks_once() {
        let ctx = CallContext::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        ctx.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let clone = ctx.clone();
        clone.cancel();
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_after_cancel_runs_immediately() {
        let ctx = CallContext::new();
        ctx.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        ctx.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metadata_lookup() {
        let ctx = CallContext::new().with_metadata("authorization", &bearer("abc"));
        assert_eq!(ctx.metadata("authorization").as_deref(), Some("Bearer abc"));
        assert_eq!(ctx.metadata("missing"), None);
    }

    #[test]
    fn values_serialize_tagged() {
        let json = serde_json::to_string(&DatapointValue::Float(1.5)).unwrap();
        assert_eq!(json, r#"{"type":"float","value":1.5}"#);
    }
}
