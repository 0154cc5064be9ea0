// Serenity implementation of the moderation platform port.

use super::formatter::format_case_notification;
use crate::core::security::{CaseNotification, MemberProfile, MessageRef, ModerationPlatform, PlatformError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poise::serenity_prelude as serenity;
use std::sync::Arc;

/// How much message history to purge when banning, in days.
const BAN_DELETE_MESSAGE_DAYS: u8 = 1;

pub struct SerenityPlatform {
    http: Arc<serenity::Http>,
}

impl SerenityPlatform {
    pub fn new(http: Arc<serenity::Http>) -> Self {
        Self { http }
    }
}

fn is_not_found(e: &serenity::Error) -> bool {
    matches!(
        e,
        serenity::Error::Http(::serenity::http::HttpError::UnsuccessfulRequest(resp))
            if resp.status_code.as_u16() == 404
    )
}

fn api_error(e: serenity::Error) -> PlatformError {
    PlatformError::Api(e.to_string())
}

pub(crate) fn to_utc(ts: serenity::Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.unix_timestamp(), 0).unwrap_or_else(Utc::now)
}

/// Snapshot of a user as the detector sees them.
pub fn member_profile(user: &serenity::User, joined_at: Option<serenity::Timestamp>) -> MemberProfile {
    MemberProfile {
        user_id: user.id.get(),
        username: user.name.clone(),
        account_created_at: to_utc(user.created_at()),
        joined_at: joined_at.map(to_utc),
        is_bot: user.bot,
        avatar_url: user.avatar_url(),
    }
}

#[async_trait]
impl ModerationPlatform for SerenityPlatform {
    async fn fetch_member(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<MemberProfile>, PlatformError> {
        match self
            .http
            .get_member(serenity::GuildId::new(guild_id), serenity::UserId::new(user_id))
            .await
        {
            Ok(member) => Ok(Some(member_profile(&member.user, member.joined_at))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(api_error(e)),
        }
    }

    async fn send_notification(
        &self,
        channel_id: u64,
        notification: &CaseNotification,
    ) -> Result<MessageRef, PlatformError> {
        let message = serenity::ChannelId::new(channel_id)
            .send_message(
                &self.http,
                serenity::CreateMessage::new().embed(format_case_notification(notification)),
            )
            .await
            .map_err(api_error)?;

        Ok(MessageRef {
            channel_id,
            message_id: message.id.get(),
        })
    }

    async fn edit_notification(
        &self,
        message: MessageRef,
        notification: &CaseNotification,
    ) -> Result<(), PlatformError> {
        serenity::ChannelId::new(message.channel_id)
            .edit_message(
                &self.http,
                serenity::MessageId::new(message.message_id),
                serenity::EditMessage::new().embed(format_case_notification(notification)),
            )
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.http
            .add_member_role(
                serenity::GuildId::new(guild_id),
                serenity::UserId::new(user_id),
                serenity::RoleId::new(role_id),
                Some(reason),
            )
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    PlatformError::MemberNotFound { guild_id, user_id }
                } else {
                    api_error(e)
                }
            })
    }

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.http
            .remove_member_role(
                serenity::GuildId::new(guild_id),
                serenity::UserId::new(user_id),
                serenity::RoleId::new(role_id),
                Some(reason),
            )
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    PlatformError::MemberNotFound { guild_id, user_id }
                } else {
                    api_error(e)
                }
            })
    }

    async fn ban_member(
        &self,
        guild_id: u64,
        user_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError> {
        serenity::GuildId::new(guild_id)
            .ban_with_reason(
                &self.http,
                serenity::UserId::new(user_id),
                BAN_DELETE_MESSAGE_DAYS,
                reason,
            )
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    PlatformError::MemberNotFound { guild_id, user_id }
                } else {
                    api_error(e)
                }
            })
    }

    async fn create_thread(&self, message: MessageRef, name: &str) -> Result<u64, PlatformError> {
        let thread = serenity::ChannelId::new(message.channel_id)
            .create_thread_from_message(
                &self.http,
                serenity::MessageId::new(message.message_id),
                serenity::CreateThread::new(name),
            )
            .await
            .map_err(api_error)?;
        Ok(thread.id.get())
    }

    async fn post_to_thread(&self, thread_id: u64, content: &str) -> Result<(), PlatformError> {
        serenity::ChannelId::new(thread_id)
            .say(&self.http, content)
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn set_thread_archived(
        &self,
        thread_id: u64,
        archived: bool,
    ) -> Result<(), PlatformError> {
        serenity::ChannelId::new(thread_id)
            .edit_thread(&self.http, serenity::EditThread::new().archived(archived))
            .await
            .map_err(api_error)?;
        Ok(())
    }
}
