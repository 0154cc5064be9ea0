// Platform port - everything the pipeline needs from the chat platform.
//
// The Discord layer implements this with serenity. Subscribers and the
// actuator only ever talk to the platform through this trait.

use super::security_models::{
    CaseStatus, DetectionResult, MemberProfile, MessageRef, SignalType, VerificationCase,
};
use super::security_store::SecurityError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Member {user_id} not found in guild {guild_id}")]
    MemberNotFound { guild_id: u64, user_id: u64 },

    #[error("Platform API error: {0}")]
    Api(String),
}

impl From<PlatformError> for SecurityError {
    fn from(e: PlatformError) -> Self {
        SecurityError::PlatformError(e.to_string())
    }
}

/// Everything a moderation notification shows.
///
/// Built from the case so an edit always reflects the current case state.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseNotification {
    pub case_id: u64,
    pub guild_id: u64,
    pub user_id: u64,
    pub status: CaseStatus,
    pub confidence: f64,
    pub detection_count: u32,
    pub trigger_source: Option<SignalType>,
    pub trigger_content: Option<String>,
    pub reasons: Vec<String>,
    pub signals: Vec<String>,
    pub resolved_by: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaseNotification {
    /// Render a case, optionally with the detection that just touched it.
    pub fn for_case(case: &VerificationCase, detection: Option<&DetectionResult>) -> Self {
        Self {
            case_id: case.id,
            guild_id: case.guild_id,
            user_id: case.user_id,
            status: case.status,
            confidence: detection
                .map(|d| d.confidence)
                .unwrap_or(case.metadata.last_confidence),
            detection_count: case.metadata.detection_count,
            trigger_source: detection.map(|d| d.trigger_source),
            trigger_content: detection.and_then(|d| d.trigger_content.clone()),
            reasons: detection.map(|d| d.reasons.clone()).unwrap_or_default(),
            signals: case.metadata.signals.clone(),
            resolved_by: case.resolved_by,
            created_at: case.created_at,
            updated_at: case.updated_at,
        }
    }
}

#[async_trait]
pub trait ModerationPlatform: Send + Sync {
    /// Look up a member. `Ok(None)` if they are not in the guild.
    async fn fetch_member(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<MemberProfile>, PlatformError>;

    async fn send_notification(
        &self,
        channel_id: u64,
        notification: &CaseNotification,
    ) -> Result<MessageRef, PlatformError>;

    async fn edit_notification(
        &self,
        message: MessageRef,
        notification: &CaseNotification,
    ) -> Result<(), PlatformError>;

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn ban_member(&self, guild_id: u64, user_id: u64, reason: &str)
        -> Result<(), PlatformError>;

    /// Start a discussion thread on a message. Returns the thread id.
    async fn create_thread(&self, message: MessageRef, name: &str) -> Result<u64, PlatformError>;

    async fn post_to_thread(&self, thread_id: u64, content: &str) -> Result<(), PlatformError>;

    async fn set_thread_archived(&self, thread_id: u64, archived: bool)
        -> Result<(), PlatformError>;
}

/// Resolve a member, logging and swallowing "not found".
///
/// Every subscriber that touches a member goes through here first.
pub async fn resolve_member(
    platform: &dyn ModerationPlatform,
    guild_id: u64,
    user_id: u64,
) -> Result<Option<MemberProfile>, PlatformError> {
    match platform.fetch_member(guild_id, user_id).await {
        Ok(Some(member)) => Ok(Some(member)),
        Ok(None) | Err(PlatformError::MemberNotFound { .. }) => {
            tracing::warn!(guild_id, user_id, "Member not found, skipping");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
