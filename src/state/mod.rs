//! State management.
//!
//! Persists what was last applied, per logical resource, so the next run
//! can diff against it. Backends implement [`StateStore`]; a run talks to
//! the store only through a locked [`StateSession`].

mod local;
mod lock;
mod s3;
mod session;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{HEARTBEAT_SECS, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use session::StateSession;
pub use store::StateStore;
pub use types::{
    PendingAction, PendingOperation, RunHistoryEntry, RunOperation, STATE_VERSION, StateRecord,
    StateSnapshot,
};
