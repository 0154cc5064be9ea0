// Posts and maintains the moderation notification for a case.
//
// - CaseOpened: post the notification and link its message id to the case
// - AdditionalSuspicionDetected: edit the linked message in place, or post
//   and backfill the link if an earlier send failed
// - CaseVerified / CaseBanned / CaseReopened: refresh the status shown, or
//   post and backfill the link if the case never got a notification

use crate::core::security::event_bus::{SecurityEvent, SecurityEventHandler, SecurityEventKind};
use crate::core::security::platform::{CaseNotification, ModerationPlatform};
use crate::core::security::security_models::{DetectionResult, VerificationCase};
use crate::core::security::security_store::{CaseStore, SecurityConfigStore};
use async_trait::async_trait;
use std::sync::Arc;

pub struct NotificationSubscriber {
    config: Arc<dyn SecurityConfigStore>,
    cases: Arc<dyn CaseStore>,
    platform: Arc<dyn ModerationPlatform>,
}

impl NotificationSubscriber {
    pub fn new(
        config: Arc<dyn SecurityConfigStore>,
        cases: Arc<dyn CaseStore>,
        platform: Arc<dyn ModerationPlatform>,
    ) -> Self {
        Self {
            config,
            cases,
            platform,
        }
    }

    /// Edit the linked notification, or post a new one and link it.
    async fn upsert(
        &self,
        case: &VerificationCase,
        detection: Option<&DetectionResult>,
    ) -> anyhow::Result<()> {
        let notification = CaseNotification::for_case(case, detection);

        if let Some(message) = case.notification {
            self.platform.edit_notification(message, &notification).await?;
            tracing::debug!(case_id = case.id, "Notification updated");
            return Ok(());
        }

        let config = self.config.get_config(case.guild_id).await?;
        let Some(channel_id) = config.alert_channel_id else {
            tracing::warn!(
                guild_id = case.guild_id,
                case_id = case.id,
                "No alert channel configured, notification not sent"
            );
            return Ok(());
        };

        let message = self
            .platform
            .send_notification(channel_id, &notification)
            .await?;

        if self.cases.link_notification(case.id, message).await? {
            tracing::info!(
                case_id = case.id,
                message_id = message.message_id,
                "Notification posted"
            );
        } else {
            tracing::warn!(
                case_id = case.id,
                message_id = message.message_id,
                "Case already had a notification linked"
            );
        }
        Ok(())
    }

    /// Latest stored copy of a case, falling back to the event's snapshot.
    async fn current(&self, snapshot: &VerificationCase) -> anyhow::Result<VerificationCase> {
        Ok(self
            .cases
            .find_by_id(snapshot.id)
            .await?
            .unwrap_or_else(|| snapshot.clone()))
    }
}

#[async_trait]
impl SecurityEventHandler for NotificationSubscriber {
    fn name(&self) -> &'static str {
        "notification"
    }

    fn kinds(&self) -> &'static [SecurityEventKind] {
        &[
            SecurityEventKind::CaseOpened,
            SecurityEventKind::AdditionalSuspicionDetected,
            SecurityEventKind::CaseVerified,
            SecurityEventKind::CaseBanned,
            SecurityEventKind::CaseReopened,
        ]
    }

    async fn handle(&self, event: &SecurityEvent) -> anyhow::Result<()> {
        match event {
            SecurityEvent::CaseOpened {
                case, detection, ..
            }
            | SecurityEvent::AdditionalSuspicionDetected {
                case, detection, ..
            } => {
                let case = self.current(case).await?;
                self.upsert(&case, Some(detection)).await
            }
            SecurityEvent::CaseVerified { case_id, .. }
            | SecurityEvent::CaseBanned { case_id, .. }
            | SecurityEvent::CaseReopened { case_id, .. } => {
                let Some(case) = self.cases.find_by_id(*case_id).await? else {
                    tracing::warn!(case_id, "Case vanished before notification refresh");
                    return Ok(());
                };
                if case.notification.is_none() {
                    tracing::info!(case_id, "Backfilling missing notification after moderator action");
                }
                self.upsert(&case, None).await
            }
        }
    }
}
