// Keeps the denormalized member status (and reputation) in step with cases.

use crate::core::security::event_bus::{SecurityEvent, SecurityEventHandler, SecurityEventKind};
use crate::core::security::security_models::CaseStatus;
use crate::core::security::security_store::{MemberStore, SecurityConfigStore};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

const VERIFIED_REPUTATION: i64 = 1;
const BANNED_REPUTATION: i64 = -5;

pub struct MemberStatusSubscriber {
    config: Arc<dyn SecurityConfigStore>,
    members: Arc<dyn MemberStore>,
}

impl MemberStatusSubscriber {
    pub fn new(config: Arc<dyn SecurityConfigStore>, members: Arc<dyn MemberStore>) -> Self {
        Self { config, members }
    }
}

#[async_trait]
impl SecurityEventHandler for MemberStatusSubscriber {
    fn name(&self) -> &'static str {
        "member_status"
    }

    fn kinds(&self) -> &'static [SecurityEventKind] {
        &[
            SecurityEventKind::CaseOpened,
            SecurityEventKind::CaseVerified,
            SecurityEventKind::CaseBanned,
            SecurityEventKind::CaseReopened,
        ]
    }

    async fn handle(&self, event: &SecurityEvent) -> anyhow::Result<()> {
        // (guild, user, restricted, status, reputation delta)
        let (guild_id, user_id, restricted, status, delta) = match event {
            // Mirror what the restriction subscribers actually apply.
            SecurityEvent::CaseOpened {
                guild_id, user_id, ..
            } => {
                let config = self.config.get_config(*guild_id).await?;
                let restricted = config.auto_restrict && config.restricted_role_id.is_some();
                (*guild_id, *user_id, restricted, CaseStatus::Pending, 0)
            }
            SecurityEvent::CaseReopened {
                guild_id, user_id, ..
            } => {
                let config = self.config.get_config(*guild_id).await?;
                let restricted = config.restricted_role_id.is_some();
                (*guild_id, *user_id, restricted, CaseStatus::Pending, 0)
            }
            SecurityEvent::CaseVerified {
                guild_id, user_id, ..
            } => (*guild_id, *user_id, false, CaseStatus::Verified, VERIFIED_REPUTATION),
            SecurityEvent::CaseBanned {
                guild_id, user_id, ..
            } => (*guild_id, *user_id, true, CaseStatus::Banned, BANNED_REPUTATION),
            SecurityEvent::AdditionalSuspicionDetected { .. } => return Ok(()),
        };

        self.members
            .update_status(guild_id, user_id, restricted, status, Utc::now())
            .await?;

        if delta != 0 {
            let reputation = self
                .members
                .adjust_reputation(guild_id, user_id, delta)
                .await?;
            tracing::debug!(guild_id, user_id, reputation, "Reputation updated");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::security_models::SecurityConfig;
    use crate::core::security::test_support::{Harness, GUILD_ID};

    #[tokio::test]
    async fn test_open_case_marks_member_restricted() {
        let h = Harness::new().await;
        h.open_case(5).await;

        let status = h.store.get_status(GUILD_ID, 5).await.unwrap().unwrap();
        assert!(status.restricted);
        assert_eq!(status.verification_status, Some(CaseStatus::Pending));
    }

    #[tokio::test]
    async fn test_no_restriction_applied_means_not_restricted() {
        let h = Harness::new().await;
        let config = SecurityConfig {
            auto_restrict: false,
            ..h.config().await
        };
        h.store.save_config(GUILD_ID, config).await.unwrap();

        h.open_case(5).await;

        let status = h.store.get_status(GUILD_ID, 5).await.unwrap().unwrap();
        assert!(!status.restricted);
        assert_eq!(status.verification_status, Some(CaseStatus::Pending));
    }
}
