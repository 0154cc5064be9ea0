// Applies the restricted role when a case opens.

use crate::core::security::event_bus::{SecurityEvent, SecurityEventHandler, SecurityEventKind};
use crate::core::security::platform::{resolve_member, ModerationPlatform};
use crate::core::security::security_store::SecurityConfigStore;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RestrictionSubscriber {
    config: Arc<dyn SecurityConfigStore>,
    platform: Arc<dyn ModerationPlatform>,
}

impl RestrictionSubscriber {
    pub fn new(config: Arc<dyn SecurityConfigStore>, platform: Arc<dyn ModerationPlatform>) -> Self {
        Self { config, platform }
    }
}

#[async_trait]
impl SecurityEventHandler for RestrictionSubscriber {
    fn name(&self) -> &'static str {
        "restriction"
    }

    fn kinds(&self) -> &'static [SecurityEventKind] {
        &[SecurityEventKind::CaseOpened]
    }

    async fn handle(&self, event: &SecurityEvent) -> anyhow::Result<()> {
        let SecurityEvent::CaseOpened {
            guild_id,
            user_id,
            case,
            ..
        } = event
        else {
            return Ok(());
        };

        let config = self.config.get_config(*guild_id).await?;
        if !config.auto_restrict {
            tracing::debug!(guild_id, user_id, "Auto-restrict disabled, not restricting");
            return Ok(());
        }

        let Some(role_id) = config.restricted_role_id else {
            tracing::warn!(guild_id, "No restricted role configured, cannot restrict");
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
                &format!("Security case #{} opened", case.id),
            )
            .await?;

        tracing::info!(guild_id, user_id, case_id = case.id, "Member restricted");
        Ok(())
    }
}
