pub mod in_memory;
pub mod openrouter_classifier;
pub mod sqlite_security_store;

pub use in_memory::InMemorySecurityStore;
pub use openrouter_classifier::{OpenRouterClassifier, DEFAULT_MODEL};
pub use sqlite_security_store::SqliteSecurityStore;
