// Security slash commands: moderator case actions, configuration and
// member reports.

use crate::core::security::{
    DetectionOrchestrator, MemberStore, ModerationActuator, SecurityActionService,
    SecurityConfig, SecurityConfigStore, SecurityError, SuspicionOutcome, VerificationCase,
    MAX_MESSAGES_PER_WINDOW, MAX_RATE_WINDOW_SECS,
};
use poise::serenity_prelude as serenity;
use std::sync::Arc;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

/// Shared state handed to every command and event handler.
pub struct Data {
    pub detection: Arc<DetectionOrchestrator>,
    pub security: Arc<SecurityActionService>,
    pub actuator: Arc<ModerationActuator>,
    pub config: Arc<dyn SecurityConfigStore>,
    pub members: Arc<dyn MemberStore>,
}

#[derive(Debug, Clone, Copy, poise::ChoiceParameter)]
pub enum KeywordAction {
    #[name = "Add"]
    Add,
    #[name = "Remove"]
    Remove,
    #[name = "List"]
    List,
}

/// Errors a moderator can fix by changing their input; shown to them
/// instead of being treated as a command failure.
fn user_facing(e: &SecurityError) -> bool {
    matches!(
        e,
        SecurityError::CaseNotFound(_)
            | SecurityError::InvalidTransition { .. }
            | SecurityError::ActiveCaseExists { .. }
            | SecurityError::NoNotification(_)
            | SecurityError::Conflict { .. }
    )
}

/// Reply with the outcome of a case action.
async fn reply_case_result(
    ctx: Context<'_>,
    result: Result<VerificationCase, SecurityError>,
    success: impl FnOnce(&VerificationCase) -> String,
) -> Result<(), Error> {
    match result {
        Ok(case) => {
            ctx.say(success(&case)).await?;
            Ok(())
        }
        Err(e) if user_facing(&e) => {
            ctx.send(
                poise::CreateReply::default()
                    .content(format!("❌ {}", e))
                    .ephemeral(true),
            )
            .await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn format_case_line(case: &VerificationCase) -> String {
    format!(
        "**#{}** {} · {} detection(s) · opened <t:{}:R>",
        case.id,
        case.status,
        case.metadata.detection_count,
        case.created_at.timestamp()
    )
}

/// Security case management.
#[poise::command(
    slash_command,
    subcommands("verify", "ban", "reopen", "thread", "flag", "case", "audit", "config", "keywords"),
    required_permissions = "MODERATE_MEMBERS",
    guild_only
)]
pub async fn security(_ctx: Context<'_>) -> Result<(), Error> {
    // Parent command - shows help
    Ok(())
}

/// Clear a member: lift the restriction and close the case.
#[poise::command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn verify(
    ctx: Context<'_>,
    #[description = "Case number"] case_id: u64,
    #[description = "Notes for the audit log"] notes: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.defer().await?;

    let result = ctx
        .data()
        .actuator
        .verify(guild_id.get(), case_id, ctx.author().id.get(), notes.as_deref())
        .await;

    reply_case_result(ctx, result, |case| {
        format!("✅ Case #{} verified, <@{}> is unrestricted.", case.id, case.user_id)
    })
    .await
}

/// Ban the member behind a case.
#[poise::command(slash_command, guild_only, required_permissions = "BAN_MEMBERS")]
pub async fn ban(
    ctx: Context<'_>,
    #[description = "Case number"] case_id: u64,
    #[description = "Reason (shown in the audit log)"] reason: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.defer().await?;

    let reason = reason.unwrap_or_else(|| format!("Security case #{}", case_id));
    let result = ctx
        .data()
        .actuator
        .ban(guild_id.get(), case_id, ctx.author().id.get(), &reason)
        .await;

    reply_case_result(ctx, result, |case| {
        format!("🔨 Case #{} closed, <@{}> has been banned.", case.id, case.user_id)
    })
    .await
}

/// Reopen a verified or banned case.
#[poise::command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn reopen(
    ctx: Context<'_>,
    #[description = "Case number"] case_id: u64,
    #[description = "Why the case is being reopened"] notes: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.defer().await?;

    let result = ctx
        .data()
        .actuator
        .reopen(guild_id.get(), case_id, ctx.author().id.get(), notes.as_deref())
        .await;

    reply_case_result(ctx, result, |case| {
        format!("🔁 Case #{} reopened for <@{}>.", case.id, case.user_id)
    })
    .await
}

/// Open a discussion thread on a case notification.
#[poise::command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn thread(
    ctx: Context<'_>,
    #[description = "Case number"] case_id: u64,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.defer_ephemeral().await?;

    let result = ctx
        .data()
        .actuator
        .open_thread(guild_id.get(), case_id, ctx.author().id.get())
        .await;

    reply_case_result(ctx, result, |case| match case.thread_id {
        Some(thread_id) => format!("🧵 Discussion for case #{}: <#{}>", case.id, thread_id),
        None => format!("🧵 Thread for case #{} is being created.", case.id),
    })
    .await
}

/// Flag a member for review by hand.
#[poise::command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn flag(
    ctx: Context<'_>,
    #[description = "Member to flag"] user: serenity::User,
    #[description = "Why they need review"] reason: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?.get();
    ctx.defer().await?;

    let data = ctx.data();
    let detection = data
        .detection
        .flag_manual(guild_id, user.id.get(), ctx.author().id.get(), &reason)
        .await;
    let outcome = data
        .security
        .handle_suspicion(guild_id, user.id.get(), detection, None)
        .await?;

    let message = match outcome {
        SuspicionOutcome::Opened(case) => format!("🚩 Opened case #{} for <@{}>.", case.id, user.id),
        SuspicionOutcome::Merged(case) => format!(
            "🚩 Added to existing case #{} for <@{}>.",
            case.id, user.id
        ),
        SuspicionOutcome::Ignored => "Nothing to do.".to_string(),
    };
    ctx.say(message).await?;
    Ok(())
}

/// Show a member's security history.
#[poise::command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn case(
    ctx: Context<'_>,
    #[description = "Member to look up"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?.get();
    let data = ctx.data();

    let history = data.security.case_history(guild_id, user.id.get()).await?;
    let status = data.members.get_status(guild_id, user.id.get()).await?;

    if history.is_empty() {
        ctx.send(
            poise::CreateReply::default()
                .content(format!("<@{}> has no security cases.", user.id))
                .ephemeral(true),
        )
        .await?;
        return Ok(());
    }

    let cases = history
        .iter()
        .take(10)
        .map(format_case_line)
        .collect::<Vec<_>>()
        .join("\n");

    let mut embed = serenity::CreateEmbed::new()
        .title(format!("🛡️ Security History: {}", user.name))
        .color(0x5865F2)
        .field("Cases", cases, false);

    if let Some(status) = status {
        embed = embed
            .field(
                "Restricted",
                if status.restricted { "Yes" } else { "No" },
                true,
            )
            .field("Reputation", status.reputation.to_string(), true);
    }
    if history.len() > 10 {
        embed = embed.footer(serenity::CreateEmbedFooter::new(format!(
            "Showing 10 of {} cases",
            history.len()
        )));
    }

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

/// Show the moderator audit trail for a case.
#[poise::command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn audit(
    ctx: Context<'_>,
    #[description = "Case number"] case_id: u64,
) -> Result<(), Error> {
    let actions = ctx.data().actuator.audit_trail(case_id).await?;
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?.get();

    // Case ids are global; don't show another guild's trail
    let actions: Vec<_> = actions.into_iter().filter(|a| a.guild_id == guild_id).collect();

    let content = if actions.is_empty() {
        format!("No moderator actions recorded for case #{}.", case_id)
    } else {
        let lines = actions
            .iter()
            .map(|a| {
                let mut line = format!(
                    "<t:{}:f> <@{}> **{}** ({} → {})",
                    a.created_at.timestamp(),
                    a.moderator_id,
                    a.action_type.as_str(),
                    a.previous_status,
                    a.new_status
                );
                if let Some(notes) = &a.notes {
                    line.push_str(&format!("\n> {}", notes));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("📜 **Audit trail for case #{}**\n{}", case_id, lines)
    };

    ctx.send(poise::CreateReply::default().content(content).ephemeral(true))
        .await?;
    Ok(())
}

fn validate_config(config: &SecurityConfig) -> Result<(), SecurityError> {
    if !(0.0..=1.0).contains(&config.confidence_threshold) {
        return Err(SecurityError::ConfigError(
            "Threshold must be between 0 and 1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.ai_review_floor)
        || config.ai_review_floor > config.confidence_threshold
    {
        return Err(SecurityError::ConfigError(
            "AI review floor must be between 0 and the threshold".to_string(),
        ));
    }
    if config.max_messages_per_window == 0 || config.rate_window_secs == 0 {
        return Err(SecurityError::ConfigError(
            "Rate limit values must be positive".to_string(),
        ));
    }
    if config.rate_window_secs > MAX_RATE_WINDOW_SECS {
        return Err(SecurityError::ConfigError(format!(
            "Rate window can be at most {} seconds",
            MAX_RATE_WINDOW_SECS
        )));
    }
    if config.max_messages_per_window > MAX_MESSAGES_PER_WINDOW {
        return Err(SecurityError::ConfigError(format!(
            "Messages per window can be at most {}",
            MAX_MESSAGES_PER_WINDOW
        )));
    }
    Ok(())
}

/// View or change security settings.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn config(
    ctx: Context<'_>,
    #[description = "Turn detection on or off"] enabled: Option<bool>,
    #[description = "Confidence needed to open a case (default: 0.7)"] threshold: Option<f64>,
    #[description = "Minimum heuristic score before the AI is asked (default: 0.2)"]
    ai_review_floor: Option<f64>,
    #[description = "Restrict members automatically when a case opens"] auto_restrict: Option<bool>,
    #[description = "Role given to restricted members"] restricted_role: Option<serenity::Role>,
    #[description = "Channel for case notifications"] alert_channel: Option<serenity::Channel>,
    #[description = "Accounts younger than this many days count as new (default: 7)"]
    min_account_age_days: Option<u32>,
    #[description = "Messages allowed per window (default: 6)"] max_messages: Option<u32>,
    #[description = "Rate window in seconds (default: 10)"] window_secs: Option<u64>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?.get();
    let store = &ctx.data().config;

    let mut config = store.get_config(guild_id).await?;

    // Apply updates
    if let Some(v) = enabled {
        config.enabled = v;
    }
    if let Some(v) = threshold {
        config.confidence_threshold = v;
    }
    if let Some(v) = ai_review_floor {
        config.ai_review_floor = v;
    }
    if let Some(v) = auto_restrict {
        config.auto_restrict = v;
    }
    if let Some(role) = restricted_role {
        config.restricted_role_id = Some(role.id.get());
    }
    if let Some(channel) = alert_channel {
        config.alert_channel_id = Some(channel.id().get());
    }
    if let Some(v) = min_account_age_days {
        config.min_account_age_days = v;
    }
    if let Some(v) = max_messages {
        config.max_messages_per_window = v;
    }
    if let Some(v) = window_secs {
        config.rate_window_secs = v;
    }

    if let Err(e) = validate_config(&config) {
        ctx.send(
            poise::CreateReply::default()
                .content(format!("❌ {}", e))
                .ephemeral(true),
        )
        .await?;
        return Ok(());
    }

    store.save_config(guild_id, config.clone()).await?;
    tracing::info!(guild_id, moderator_id = ctx.author().id.get(), "Security config updated");

    let role = config
        .restricted_role_id
        .map(|id| format!("<@&{}>", id))
        .unwrap_or_else(|| "not set".to_string());
    let channel = config
        .alert_channel_id
        .map(|id| format!("<#{}>", id))
        .unwrap_or_else(|| "not set".to_string());

    ctx.say(format!(
        "🛡️ Security configuration\n\
         • Detection: {}\n\
         • Threshold: {:.2} (AI review from {:.2})\n\
         • Auto-restrict: {} with role {}\n\
         • Alerts: {}\n\
         • New account: under {} days\n\
         • Rate limit: {} msgs / {} sec\n\
         • Keywords: {}",
        if config.enabled { "enabled" } else { "disabled" },
        config.confidence_threshold,
        config.ai_review_floor,
        if config.auto_restrict { "on" } else { "off" },
        role,
        channel,
        config.min_account_age_days,
        config.max_messages_per_window,
        config.rate_window_secs,
        config.keywords.len()
    ))
    .await?;
    Ok(())
}

/// Manage the scam keyword list.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn keywords(
    ctx: Context<'_>,
    #[description = "What to do"] action: KeywordAction,
    #[description = "Keyword or phrase"] keyword: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?.get();
    let store = &ctx.data().config;
    let mut config = store.get_config(guild_id).await?;

    let keyword = keyword
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty());

    let message = match (action, keyword) {
        (KeywordAction::List, _) => {
            if config.keywords.is_empty() {
                "No keywords configured.".to_string()
            } else {
                format!("🔎 Keywords: {}", config.keywords.join(", "))
            }
        }
        (_, None) => "❌ Please provide a keyword.".to_string(),
        (KeywordAction::Add, Some(keyword)) => {
            if config.keywords.contains(&keyword) {
                format!("`{}` is already on the list.", keyword)
            } else {
                config.keywords.push(keyword.clone());
                store.save_config(guild_id, config).await?;
                format!("✅ Added `{}`.", keyword)
            }
        }
        (KeywordAction::Remove, Some(keyword)) => {
            let before = config.keywords.len();
            config.keywords.retain(|k| k != &keyword);
            if config.keywords.len() == before {
                format!("`{}` was not on the list.", keyword)
            } else {
                store.save_config(guild_id, config).await?;
                format!("🗑️ Removed `{}`.", keyword)
            }
        }
    };

    ctx.send(poise::CreateReply::default().content(message).ephemeral(true))
        .await?;
    Ok(())
}

/// Report a member to the moderators.
#[poise::command(slash_command, guild_only)]
pub async fn report(
    ctx: Context<'_>,
    #[description = "Member to report"] user: serenity::User,
    #[description = "What happened"] reason: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?.get();
    ctx.defer_ephemeral().await?;

    if user.bot || user.id == ctx.author().id {
        ctx.say("You can't report that user.").await?;
        return Ok(());
    }

    let data = ctx.data();
    let detection = data
        .detection
        .detect_report(guild_id, user.id.get(), ctx.author().id.get(), &reason, None)
        .await;
    let outcome = data
        .security
        .handle_suspicion(guild_id, user.id.get(), detection, None)
        .await?;

    tracing::info!(
        guild_id,
        user_id = user.id.get(),
        reporter_id = ctx.author().id.get(),
        case_id = outcome.case().map(|c| c.id),
        "Member reported"
    );

    ctx.say("✅ Thanks, the moderators have been notified.").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_config_bounds() {
        assert!(validate_config(&SecurityConfig::default()).is_ok());

        let too_high = SecurityConfig {
            confidence_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            validate_config(&too_high),
            Err(SecurityError::ConfigError(_))
        ));

        let floor_above_threshold = SecurityConfig {
            confidence_threshold: 0.5,
            ai_review_floor: 0.6,
            ..Default::default()
        };
        assert!(validate_config(&floor_above_threshold).is_err());

        let no_window = SecurityConfig {
            rate_window_secs: 0,
            ..Default::default()
        };
        assert!(validate_config(&no_window).is_err());
    }

    #[test]
    fn test_validate_config_rejects_oversized_rate_limits() {
        let day = SecurityConfig {
            rate_window_secs: MAX_RATE_WINDOW_SECS,
            max_messages_per_window: MAX_MESSAGES_PER_WINDOW,
            ..Default::default()
        };
        assert!(validate_config(&day).is_ok());

        let huge_window = SecurityConfig {
            rate_window_secs: 10_000_000_000_000,
            ..Default::default()
        };
        assert!(matches!(
            validate_config(&huge_window),
            Err(SecurityError::ConfigError(_))
        ));

        let too_many = SecurityConfig {
            max_messages_per_window: MAX_MESSAGES_PER_WINDOW + 1,
            ..Default::default()
        };
        assert!(validate_config(&too_many).is_err());
    }

    #[test]
    fn test_user_facing_errors() {
        assert!(user_facing(&SecurityError::CaseNotFound(1)));
        assert!(user_facing(&SecurityError::NoNotification(1)));
        assert!(!user_facing(&SecurityError::StorageError("disk".to_string())));
    }
}
