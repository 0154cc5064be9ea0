// Discord layer - commands, event handlers and the platform adapter.

#[path = "security/mod.rs"]
pub mod security;

// Re-export command types for convenience
pub use security::commands::{Data, Error};
