//! Versioned application releases behind an atomically swapped `current` pointer.

mod manager;
mod types;

pub use manager::ReleaseManager;
pub use types::{
    is_release_id, next_release_id, DeployReport, Release, ReleaseLayout, ReleaseSettings,
    ReleaseSource, ReleaseStatus, RollbackReport,
};
