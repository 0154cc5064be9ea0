// Core security module - detection, case orchestration and moderation.
// Pure domain logic; the platform and storage sit behind the ports in
// `platform` and `security_store`.

pub mod actor_locks;
pub mod case_state;
pub mod detection_service;
pub mod event_bus;
pub mod heuristics;
pub mod moderation_actuator;
pub mod platform;
pub mod security_action_service;
pub mod security_models;
pub mod security_store;
pub mod subscribers;

#[cfg(test)]
pub mod test_support;

pub use actor_locks::ActorLocks;
pub use detection_service::{
    ClassifierError, ClassifierInput, ClassifierVerdict, DetectionOrchestrator,
    SuspicionClassifier,
};
pub use event_bus::{EventBus, SecurityEvent, SecurityEventHandler, SecurityEventKind};
pub use moderation_actuator::ModerationActuator;
pub use platform::{CaseNotification, ModerationPlatform, PlatformError};
pub use security_action_service::{SecurityActionService, SuspicionOutcome};
pub use security_models::*;
pub use security_store::*;
