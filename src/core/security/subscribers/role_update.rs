// Lifts the restricted role once a case is verified.

use crate::core::security::event_bus::{SecurityEvent, SecurityEventHandler, SecurityEventKind};
use crate::core::security::platform::{resolve_member, ModerationPlatform};
use crate::core::security::security_store::SecurityConfigStore;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RoleUpdateSubscriber {
    config: Arc<dyn SecurityConfigStore>,
    platform: Arc<dyn ModerationPlatform>,
}

impl RoleUpdateSubscriber {
    pub fn new(config: Arc<dyn SecurityConfigStore>, platform: Arc<dyn ModerationPlatform>) -> Self {
        Self { config, platform }
    }
}

#[async_trait]
impl SecurityEventHandler for RoleUpdateSubscriber {
    fn name(&self) -> &'static str {
        "role_update"
    }

    fn kinds(&self) -> &'static [SecurityEventKind] {
        &[SecurityEventKind::CaseVerified]
    }

    async fn handle(&self, event: &SecurityEvent) -> anyhow::Result<()> {
        let SecurityEvent::CaseVerified {
            guild_id,
            user_id,
            case_id,
            ..
        } = event
        else {
            return Ok(());
        };

        let config = self.config.get_config(*guild_id).await?;
        let Some(role_id) = config.restricted_role_id else {
            tracing::warn!(guild_id, "No restricted role configured, nothing to remove");
            return Ok(());
        };

        if resolve_member(self.platform.as_ref(), *guild_id, *user_id)
            .await?
            .is_none()
        {
            return Ok(());
        }

        self.platform
            .remove_role(
                *guild_id,
                *user_id,
                role_id,
                &format!("Security case #{} verified", case_id),
            )
            .await?;

        tracing::info!(guild_id, user_id, case_id, "Restriction lifted");
        Ok(())
    }
}
