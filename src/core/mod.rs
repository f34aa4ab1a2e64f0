// Public modules
pub mod config;
pub mod deadline;
pub mod error;
pub mod health;
pub mod host;
pub mod lock;
pub mod notify;
pub mod ops;
pub mod phases;
pub mod pipeline;
pub mod release;
pub mod rotation;
pub mod secrets;
pub mod ssh;

// Internal modules - not part of public API
pub(crate) mod local_files;
pub(crate) mod paths;

// Public modules for CLI access
pub mod defaults;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
