pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod github;
pub mod model;
pub mod permission;
pub mod resume;
pub mod session;
pub mod sync;

pub use error::{ApiError, ScopeDiagnostic, SyncError};
pub use sync::{PullReport, Syncer};
