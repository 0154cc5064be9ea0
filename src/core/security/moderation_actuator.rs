// Moderation actuator - executes moderator decisions on cases.
//
// Every transition goes through the case state machine and a status-guarded
// write, under the same per-member lock the action service uses. Side
// effects (unrestrict, audit, status sync, re-restrict) are left to the
// subscribers of the event published afterwards. Banning is the exception:
// the platform ban happens first, so a failed ban leaves the case pending.

use super::actor_locks::ActorLocks;
use super::case_state::{plan_transition, CaseTransition};
use super::event_bus::{EventBus, SecurityEvent};
use super::platform::{ModerationPlatform, PlatformError};
use super::security_models::{
    AdminAction, AdminActionType, CaseUpdate, NewAdminAction, VerificationCase,
};
use super::security_store::{AdminActionStore, CaseStore, SecurityError};
use chrono::Utc;
use std::sync::Arc;

pub struct ModerationActuator {
    cases: Arc<dyn CaseStore>,
    admin_actions: Arc<dyn AdminActionStore>,
    platform: Arc<dyn ModerationPlatform>,
    bus: Arc<EventBus>,
    locks: Arc<ActorLocks>,
}

impl ModerationActuator {
    pub fn new(
        cases: Arc<dyn CaseStore>,
        admin_actions: Arc<dyn AdminActionStore>,
        platform: Arc<dyn ModerationPlatform>,
        bus: Arc<EventBus>,
        locks: Arc<ActorLocks>,
    ) -> Self {
        Self {
            cases,
            admin_actions,
            platform,
            bus,
            locks,
        }
    }

    /// PENDING -> VERIFIED.
    pub async fn verify(
        &self,
        guild_id: u64,
        case_id: u64,
        moderator_id: u64,
        notes: Option<&str>,
    ) -> Result<VerificationCase, SecurityError> {
        let user_id = self.case_owner(guild_id, case_id).await?;
        let _guard = self.locks.lock(guild_id, user_id).await;

        let case = self.load_case(guild_id, case_id).await?;
        let updated = self
            .apply(&case, CaseTransition::Verify, moderator_id, notes)
            .await?;

        tracing::info!(guild_id, user_id, case_id, moderator_id, "Case verified");

        self.bus
            .publish(SecurityEvent::CaseVerified {
                guild_id,
                user_id,
                moderator_id,
                case_id,
                notes: clean_notes(notes),
            })
            .await;

        Ok(updated)
    }

    /// PENDING -> BANNED. Bans the member on the platform first.
    pub async fn ban(
        &self,
        guild_id: u64,
        case_id: u64,
        moderator_id: u64,
        reason: &str,
    ) -> Result<VerificationCase, SecurityError> {
        let user_id = self.case_owner(guild_id, case_id).await?;
        let _guard = self.locks.lock(guild_id, user_id).await;

        let case = self.load_case(guild_id, case_id).await?;
        // Validate before touching the platform.
        plan_transition(&case, CaseTransition::Ban, moderator_id, None, Utc::now())?;

        match self.platform.ban_member(guild_id, user_id, reason).await {
            Ok(()) => {}
            Err(PlatformError::MemberNotFound { .. }) => {
                tracing::warn!(guild_id, user_id, case_id, "Member not found while banning");
            }
            Err(e) => {
                tracing::error!(guild_id, user_id, case_id, "Platform ban failed: {}", e);
                return Err(e.into());
            }
        }

        let updated = self
            .apply(&case, CaseTransition::Ban, moderator_id, Some(reason))
            .await
            .map_err(|e| {
                tracing::error!(case_id, "Member banned but case update failed: {}", e);
                e
            })?;

        tracing::info!(guild_id, user_id, case_id, moderator_id, "Case banned");

        self.bus
            .publish(SecurityEvent::CaseBanned {
                guild_id,
                user_id,
                moderator_id,
                reason: reason.to_string(),
                case_id,
            })
            .await;

        Ok(updated)
    }

    /// VERIFIED | BANNED -> PENDING.
    ///
    /// Rejected if the member already has another pending case.
    pub async fn reopen(
        &self,
        guild_id: u64,
        case_id: u64,
        moderator_id: u64,
        notes: Option<&str>,
    ) -> Result<VerificationCase, SecurityError> {
        let user_id = self.case_owner(guild_id, case_id).await?;
        let _guard = self.locks.lock(guild_id, user_id).await;

        let case = self.load_case(guild_id, case_id).await?;
        let previous_status = case.status;
        // Validate first so a pending case reports an invalid transition.
        plan_transition(&case, CaseTransition::Reopen, moderator_id, None, Utc::now())?;

        if let Some(active) = self.cases.find_active_pending(guild_id, user_id).await? {
            if active.id != case.id {
                return Err(SecurityError::ActiveCaseExists { guild_id, user_id });
            }
        }

        let updated = self
            .apply(&case, CaseTransition::Reopen, moderator_id, notes)
            .await?;

        tracing::info!(
            guild_id,
            user_id,
            case_id,
            moderator_id,
            previous = %previous_status,
            "Case reopened"
        );

        self.bus
            .publish(SecurityEvent::CaseReopened {
                case_id,
                guild_id,
                user_id,
                moderator_id,
                previous_status,
                notes: clean_notes(notes),
            })
            .await;

        Ok(updated)
    }

    /// Start a discussion thread on the case's notification message.
    ///
    /// Returns the case unchanged if a thread already exists.
    pub async fn open_thread(
        &self,
        guild_id: u64,
        case_id: u64,
        moderator_id: u64,
    ) -> Result<VerificationCase, SecurityError> {
        let user_id = self.case_owner(guild_id, case_id).await?;
        let _guard = self.locks.lock(guild_id, user_id).await;

        let case = self.load_case(guild_id, case_id).await?;
        if case.thread_id.is_some() {
            return Ok(case);
        }
        let message = case
            .notification
            .ok_or(SecurityError::NoNotification(case_id))?;

        let thread_id = self
            .platform
            .create_thread(message, &format!("Case #{} - <@{}>", case.id, user_id))
            .await?;

        let updated = self
            .cases
            .update(
                case.id,
                case.status,
                CaseUpdate {
                    thread_id: Some(thread_id),
                    ..Default::default()
                },
            )
            .await?
            .ok_or(SecurityError::Conflict { case_id })?;

        self.admin_actions
            .create(NewAdminAction {
                guild_id,
                user_id,
                moderator_id,
                case_id,
                action_type: AdminActionType::CreateThread,
                previous_status: case.status,
                new_status: case.status,
                notes: None,
            })
            .await?;

        tracing::info!(guild_id, user_id, case_id, thread_id, "Case thread created");
        Ok(updated)
    }

    /// Audit trail for a case, oldest first.
    pub async fn audit_trail(&self, case_id: u64) -> Result<Vec<AdminAction>, SecurityError> {
        self.admin_actions.find_by_case(case_id).await
    }

    async fn apply(
        &self,
        case: &VerificationCase,
        transition: CaseTransition,
        moderator_id: u64,
        notes: Option<&str>,
    ) -> Result<VerificationCase, SecurityError> {
        let change = plan_transition(case, transition, moderator_id, notes, Utc::now())?;
        self.cases
            .update_status(case.id, case.status, change)
            .await?
            .ok_or(SecurityError::Conflict { case_id: case.id })
    }

    /// Find which member a case belongs to, so we know which lock to take.
    async fn case_owner(&self, guild_id: u64, case_id: u64) -> Result<u64, SecurityError> {
        Ok(self.load_case(guild_id, case_id).await?.user_id)
    }

    async fn load_case(&self, guild_id: u64, case_id: u64) -> Result<VerificationCase, SecurityError> {
        match self.cases.find_by_id(case_id).await? {
            Some(case) if case.guild_id == guild_id => Ok(case),
            _ => Err(SecurityError::CaseNotFound(case_id)),
        }
    }
}

fn clean_notes(notes: Option<&str>) -> Option<String> {
    notes
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

// ============================================================================
// TESTS
// ============================================================================
