// Appends an AdminAction for every moderator transition and notes it in the
// case's discussion thread, if one exists.

use crate::core::security::event_bus::{SecurityEvent, SecurityEventHandler, SecurityEventKind};
use crate::core::security::platform::ModerationPlatform;
use crate::core::security::security_models::{AdminActionType, CaseStatus, NewAdminAction};
use crate::core::security::security_store::{AdminActionStore, CaseStore};
use async_trait::async_trait;
use std::sync::Arc;

pub struct AuditLogSubscriber {
    admin_actions: Arc<dyn AdminActionStore>,
    cases: Arc<dyn CaseStore>,
    platform: Arc<dyn ModerationPlatform>,
}

impl AuditLogSubscriber {
    pub fn new(
        admin_actions: Arc<dyn AdminActionStore>,
        cases: Arc<dyn CaseStore>,
        platform: Arc<dyn ModerationPlatform>,
    ) -> Self {
        Self {
            admin_actions,
            cases,
            platform,
        }
    }
}

/// Turn a transition event into its audit entry.
fn audit_entry(event: &SecurityEvent) -> Option<NewAdminAction> {
    match event {
        SecurityEvent::CaseVerified {
            guild_id,
            user_id,
            moderator_id,
            case_id,
            notes,
        } => Some(NewAdminAction {
            guild_id: *guild_id,
            user_id: *user_id,
            moderator_id: *moderator_id,
            case_id: *case_id,
            action_type: AdminActionType::Verify,
            previous_status: CaseStatus::Pending,
            new_status: CaseStatus::Verified,
            notes: notes.clone(),
        }),
        SecurityEvent::CaseBanned {
            guild_id,
            user_id,
            moderator_id,
            reason,
            case_id,
        } => Some(NewAdminAction {
            guild_id: *guild_id,
            user_id: *user_id,
            moderator_id: *moderator_id,
            case_id: *case_id,
            action_type: AdminActionType::Ban,
            previous_status: CaseStatus::Pending,
            new_status: CaseStatus::Banned,
            notes: Some(reason.clone()),
        }),
        SecurityEvent::CaseReopened {
            case_id,
            guild_id,
            user_id,
            moderator_id,
            previous_status,
            notes,
        } => Some(NewAdminAction {
            guild_id: *guild_id,
            user_id: *user_id,
            moderator_id: *moderator_id,
            case_id: *case_id,
            action_type: AdminActionType::Reopen,
            previous_status: *previous_status,
            new_status: CaseStatus::Pending,
            notes: notes.clone(),
        }),
        SecurityEvent::CaseOpened { .. } | SecurityEvent::AdditionalSuspicionDetected { .. } => {
            None
        }
    }
}

fn thread_note(action: &NewAdminAction) -> String {
    let verb = match action.action_type {
        AdminActionType::Verify => "verified",
        AdminActionType::Ban => "banned",
        AdminActionType::Reopen => "reopened",
        AdminActionType::CreateThread => "opened a thread for",
    };
    let mut note = format!(
        "<@{}> {} <@{}> ({} -> {})",
        action.moderator_id, verb, action.user_id, action.previous_status, action.new_status
    );
    if let Some(notes) = &action.notes {
        note.push_str(&format!("\n> {}", notes));
    }
    note
}

#[async_trait]
impl SecurityEventHandler for AuditLogSubscriber {
    fn name(&self) -> &'static str {
        "audit_log"
    }

    fn kinds(&self) -> &'static [SecurityEventKind] {
        &[
            SecurityEventKind::CaseVerified,
            SecurityEventKind::CaseBanned,
            SecurityEventKind::CaseReopened,
        ]
    }

    async fn handle(&self, event: &SecurityEvent) -> anyhow::Result<()> {
        let Some(entry) = audit_entry(event) else {
            return Ok(());
        };

        let note = thread_note(&entry);
        let action = self.admin_actions.create(entry).await?;
        tracing::info!(
            case_id = action.case_id,
            moderator_id = action.moderator_id,
            action = action.action_type.as_str(),
            "Admin action recorded"
        );

        // The audit row is the record; the thread note is best effort.
        if let Some(thread_id) = self
            .cases
            .find_by_id(action.case_id)
            .await?
            .and_then(|c| c.thread_id)
        {
            if let Err(e) = self.platform.post_to_thread(thread_id, &note).await {
                tracing::warn!(case_id = action.case_id, thread_id, "Failed to annotate thread: {}", e);
            }
        }
        Ok(())
    }
}
