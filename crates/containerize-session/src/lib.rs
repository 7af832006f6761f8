//! Session store (C4) and session manager (C5): the durable, quota-aware,
//! TTL-expiring state that threads through every tool invocation.

pub mod gc;
pub mod manager;
pub mod model;
pub mod store;

pub use gc::GcReport;
pub use manager::{ManagerError, SessionManager, SessionManagerConfig};
pub use model::{JobInfo, JobProgress, JobStatus, Session, SessionFilter, SessionStatus, SessionSummary, ToolExecution};
pub use store::{MemoryStore, SessionStore, SqliteStore, StoreError};
