//! Coordinated credential rotation across dependent services.

mod coordinator;
mod plan;

pub use coordinator::{Coordinator, RotationReport, ServiceUpdate};
pub use plan::{CredentialAction, RotationPlan, ServiceTarget, ServiceTier};
