// Brings a reopened case back to life: unarchive its thread and re-restrict.
//
// The REOPEN transition itself is done by the actuator; the audit entry is
// written by the audit subscriber.

use crate::core::security::event_bus::{SecurityEvent, SecurityEventHandler, SecurityEventKind};
use crate::core::security::platform::{resolve_member, ModerationPlatform};
use crate::core::security::security_store::{CaseStore, SecurityConfigStore};
use async_trait::async_trait;
use std::sync::Arc;

pub struct ReopenSubscriber {
    config: Arc<dyn SecurityConfigStore>,
    cases: Arc<dyn CaseStore>,
    platform: Arc<dyn ModerationPlatform>,
}

impl ReopenSubscriber {
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
}

#[async_trait]
impl SecurityEventHandler for ReopenSubscriber {
    fn name(&self) -> &'static str {
        "reopen"
    }

    fn kinds(&self) -> &'static [SecurityEventKind] {
        &[SecurityEventKind::CaseReopened]
    }

    async fn handle(&self, event: &SecurityEvent) -> anyhow::Result<()> {
        let SecurityEvent::CaseReopened {
            case_id,
            guild_id,
            user_id,
            ..
        } = event
        else {
            return Ok(());
        };

        if let Some(thread_id) = self
            .cases
            .find_by_id(*case_id)
            .await?
            .and_then(|c| c.thread_id)
        {
            self.platform.set_thread_archived(thread_id, false).await?;
        }

        let config = self.config.get_config(*guild_id).await?;
        let Some(role_id) = config.restricted_role_id else {
            tracing::warn!(guild_id, case_id, "No restricted role configured, cannot re-restrict");
            return Ok(());
        };

        if resolve_member(self.platform.as_ref(), *guild_id, *user_id)
            .await?
            .is_none()
        {
            return Ok(());
        }

        self.platform
            .add_role(
                *guild_id,
                *user_id,
                role_id,
                &format!("Security case #{} reopened", case_id),
            )
            .await?;

        tracing::info!(guild_id, user_id, case_id, "Member re-restricted");
        Ok(())
    }
}
