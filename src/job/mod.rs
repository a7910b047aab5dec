//! Job record, lifecycle state machine, and single-job persistence.

pub mod record;
pub mod state;
pub mod store;

pub use record::{FailureStage, Gateway, JobFailure, JobPatch, JobRecord, JobSource, PaymentReceipt};
pub use state::{transition, JobEvent, JobState};
pub use store::{FileStore, JobStore, KeyValueStore, MemoryStore, STORAGE_KEY};
