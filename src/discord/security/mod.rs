pub mod commands;
pub mod events;
pub mod formatter;
pub mod platform;

pub use platform::SerenityPlatform;
