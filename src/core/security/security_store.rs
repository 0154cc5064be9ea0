// Storage ports for the security pipeline.
//
// Each collaborator gets its own narrow trait so services only depend on the
// capabilities they use. "Not found" is always `Ok(None)`, never an error.

use super::security_models::{
    AdminAction, CaseStatus, CaseUpdate, DetectionEvent, MemberStatus, MessageRef,
    NewAdminAction, NewDetectionEvent, NewVerificationCase, SecurityConfig, VerificationCase,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Case {0} not found")]
    CaseNotFound(u64),

    #[error("Case {case_id} is {from}, cannot {action}")]
    InvalidTransition {
        case_id: u64,
        from: CaseStatus,
        action: &'static str,
    },

    #[error("User {user_id} already has a pending case in guild {guild_id}")]
    ActiveCaseExists { guild_id: u64, user_id: u64 },

    #[error("Case {0} has no notification message yet")]
    NoNotification(u64),

    #[error("Case {case_id} was modified concurrently")]
    Conflict { case_id: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Platform error: {0}")]
    PlatformError(String),
}

// ============================================================================
// STORAGE TRAITS (PORTS)
// ============================================================================

/// Status change computed by the state machine and applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub new_status: CaseStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<u64>,
    pub updated_at: DateTime<Utc>,
    /// Replaces the case notes when set
    pub notes: Option<String>,
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    /// The single `Pending` case for a member, if any.
    async fn find_active_pending(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<VerificationCase>, SecurityError>;

    /// Insert a new `Pending` case.
    ///
    /// Returns `SecurityError::ActiveCaseExists` if the member already has one.
    async fn create(&self, case: NewVerificationCase) -> Result<VerificationCase, SecurityError>;

    /// Apply `change` only if the case is currently in `expected`.
    ///
    /// Returns `Ok(None)` when the guard fails or the case does not exist.
    async fn update_status(
        &self,
        case_id: u64,
        expected: CaseStatus,
        change: StatusChange,
    ) -> Result<Option<VerificationCase>, SecurityError>;

    /// Apply a partial update only if the case is currently in `expected`.
    async fn update(
        &self,
        case_id: u64,
        expected: CaseStatus,
        update: CaseUpdate,
    ) -> Result<Option<VerificationCase>, SecurityError>;

    /// Record the notification message, only if none is linked yet.
    ///
    /// Returns `true` when the link was written.
    async fn link_notification(
        &self,
        case_id: u64,
        notification: MessageRef,
    ) -> Result<bool, SecurityError>;

    async fn find_by_id(&self, case_id: u64) -> Result<Option<VerificationCase>, SecurityError>;

    /// Most recently created case for a member, whatever its status.
    async fn find_latest(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<VerificationCase>, SecurityError>;

    /// All cases for a member, newest first.
    async fn list_for_member(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Vec<VerificationCase>, SecurityError>;
}

#[async_trait]
pub trait DetectionEventStore: Send + Sync {
    async fn create(&self, event: NewDetectionEvent) -> Result<DetectionEvent, SecurityError>;

    /// Point a detection event at the case it affected.
    async fn link_case(&self, event_id: u64, case_id: u64) -> Result<(), SecurityError>;

    async fn find_by_id(&self, event_id: u64) -> Result<Option<DetectionEvent>, SecurityError>;
}

#[async_trait]
pub trait AdminActionStore: Send + Sync {
    async fn create(&self, action: NewAdminAction) -> Result<AdminAction, SecurityError>;

    /// Audit trail for a case, oldest first.
    async fn find_by_case(&self, case_id: u64) -> Result<Vec<AdminAction>, SecurityError>;
}

#[async_trait]
pub trait SecurityConfigStore: Send + Sync {
    /// Get config for a guild, falling back to defaults.
    async fn get_config(&self, guild_id: u64) -> Result<SecurityConfig, SecurityError>;

    async fn save_config(&self, guild_id: u64, config: SecurityConfig) -> Result<(), SecurityError>;
}

#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Create guild and member rows on first sight. Idempotent.
    async fn ensure_member(&self, guild_id: u64, user_id: u64) -> Result<(), SecurityError>;

    async fn get_status(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<MemberStatus>, SecurityError>;

    /// Overwrite the denormalized status fields (not the reputation).
    async fn update_status(
        &self,
        guild_id: u64,
        user_id: u64,
        restricted: bool,
        verification_status: CaseStatus,
        changed_at: DateTime<Utc>,
    ) -> Result<(), SecurityError>;

    /// Add `delta` to the member's reputation. Returns the new value.
    async fn adjust_reputation(
        &self,
        guild_id: u64,
        user_id: u64,
        delta: i64,
    ) -> Result<i64, SecurityError>;
}
