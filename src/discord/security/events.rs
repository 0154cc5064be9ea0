// Gateway events that feed the detector.

use super::commands::{Data, Error};
use super::platform::member_profile;
use crate::core::security::{MessageRef, SuspicionOutcome};
use poise::serenity_prelude as serenity;

/// Run a guild message through detection and open or merge a case if needed.
pub async fn handle_message(data: &Data, msg: &serenity::Message) -> Result<(), Error> {
    // Skip bots
    if msg.author.bot {
        return Ok(());
    }

    // Only check guild messages
    let guild_id = match msg.guild_id {
        Some(id) => id.get(),
        None => return Ok(()),
    };
    let user_id = msg.author.id.get();

    let joined_at = msg.member.as_ref().and_then(|m| m.joined_at);
    let profile = member_profile(&msg.author, joined_at);
    let source = MessageRef {
        channel_id: msg.channel_id.get(),
        message_id: msg.id.get(),
    };

    let detection = data
        .detection
        .detect_message(guild_id, user_id, &msg.content, &profile, Some(source))
        .await;

    if !detection.is_suspicious() {
        return Ok(());
    }

    let outcome = data
        .security
        .handle_suspicion(guild_id, user_id, detection, Some(source))
        .await?;
    log_outcome(guild_id, user_id, "message", &outcome);
    Ok(())
}

/// Screen a member as they join.
pub async fn handle_member_join(data: &Data, member: &serenity::Member) -> Result<(), Error> {
    let guild_id = member.guild_id.get();
    let user_id = member.user.id.get();
    let profile = member_profile(&member.user, member.joined_at);

    let detection = data
        .detection
        .detect_new_join(guild_id, user_id, &profile)
        .await;

    if !detection.is_suspicious() {
        tracing::debug!(guild_id, user_id, "New member passed screening");
        return Ok(());
    }

    let outcome = data
        .security
        .handle_suspicion(guild_id, user_id, detection, None)
        .await?;
    log_outcome(guild_id, user_id, "join", &outcome);
    Ok(())
}

fn log_outcome(guild_id: u64, user_id: u64, signal: &str, outcome: &SuspicionOutcome) {
    match outcome {
        SuspicionOutcome::Opened(case) => {
            tracing::info!(guild_id, user_id, case_id = case.id, signal, "Security case opened")
        }
        SuspicionOutcome::Merged(case) => {
            tracing::info!(guild_id, user_id, case_id = case.id, signal, "Signal merged into case")
        }
        SuspicionOutcome::Ignored => {}
    }
}
