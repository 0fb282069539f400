#![forbid(unsafe_code)]

pub mod auth;
pub mod clock;
pub mod config;
pub mod controller;
pub mod delete;
pub mod error;
pub mod removal;
pub mod select;
pub mod stall;
pub mod worker;

pub mod util {
    pub mod sanitize;
}

pub mod state {
    pub mod fs;
    pub mod job;
    pub mod lock;
    pub mod mem;
    mod store;

    pub use store::{StateStore, get_record, put_record};
}

pub mod storage {
    pub mod fs;
    mod object;

    pub use object::{DeleteFailure, ObjectStore};
}

pub mod catalog {
    pub mod fs;
    pub mod index;
    pub mod journal;
    pub mod variants;
    mod item;

    pub use item::{DerivedFile, DerivedKind, LibraryCounts, OffloadRecord, WorkItem, WorkItemSource};
}

// Re-exports: stable API surface
pub use config::OffloadConfig;
pub use controller::{JobController, Progress, StartOutcome, TickEvent};
pub use delete::{BulkDeleter, DeleteKeySet};
pub use error::{OffloadError, Result};
pub use removal::{DeleteNotice, RemovalHandler};
pub use select::{CandidateSelector, Selection};
pub use stall::{StallCheck, StallMonitor};
pub use worker::{OffloadWorker, UploadWorker};
