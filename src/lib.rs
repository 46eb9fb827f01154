// Re-export needed modules for testing
pub mod config;
pub mod models;
pub mod sync;

// Re-export main types for convenience
pub use models::*;
pub use sync::{MessagingClient, SyncError, UiEvent};
