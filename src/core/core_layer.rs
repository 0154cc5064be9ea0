// The core module contains all business logic.
// Each feature gets its own submodule.

#[path = "security/mod.rs"]
pub mod security;
