use crate::core::security::{CaseNotification, CaseStatus};
use poise::serenity_prelude::{self as serenity, CreateEmbed, CreateEmbedFooter};

// Discord rejects embed field values over 1024 characters.
const FIELD_LIMIT: usize = 1024;

fn status_color(status: CaseStatus) -> serenity::Color {
    match status {
        CaseStatus::Pending => serenity::Color::from_rgb(255, 165, 0), // Orange
        CaseStatus::Verified => serenity::Color::from_rgb(0, 200, 83), // Green
        CaseStatus::Banned => serenity::Color::from_rgb(213, 0, 0),    // Red
    }
}

fn status_label(status: CaseStatus) -> &'static str {
    match status {
        CaseStatus::Pending => "🟠 Pending review",
        CaseStatus::Verified => "🟢 Verified",
        CaseStatus::Banned => "🔴 Banned",
    }
}

fn clamp_field(text: String) -> String {
    if text.chars().count() <= FIELD_LIMIT {
        return text;
    }
    let mut clamped: String = text.chars().take(FIELD_LIMIT - 3).collect();
    clamped.push_str("...");
    clamped
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("• {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a case notification for the alert channel.
pub fn format_case_notification(n: &CaseNotification) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title(format!("🛡️ Security Case #{}", n.case_id))
        .description(format!("<@{}> was flagged for review.", n.user_id))
        .color(status_color(n.status))
        .field("Status", status_label(n.status), true)
        .field("Confidence", format!("{:.0}%", n.confidence * 100.0), true)
        .field("Detections", n.detection_count.to_string(), true);

    if let Some(source) = n.trigger_source {
        embed = embed.field("Trigger", source.to_string(), true);
    }
    if let Some(content) = &n.trigger_content {
        embed = embed.field("Content", clamp_field(format!("```{}```", content)), false);
    }
    if !n.reasons.is_empty() {
        embed = embed.field("Reasons", clamp_field(bullet_list(&n.reasons)), false);
    }
    if n.signals.len() > 1 {
        embed = embed.field("Recent Signals", clamp_field(bullet_list(&n.signals)), false);
    }

    embed = match (n.status, n.resolved_by) {
        (CaseStatus::Pending, _) => embed.field(
            "Actions",
            format!(
                "`/security verify case_id:{id}` · `/security ban case_id:{id}` · `/security thread case_id:{id}`",
                id = n.case_id
            ),
            false,
        ),
        (_, Some(moderator_id)) => embed.field("Resolved By", format!("<@{}>", moderator_id), true),
        (_, None) => embed,
    };

    embed = embed
        .field("Opened", format!("<t:{}:R>", n.created_at.timestamp()), true)
        .footer(CreateEmbedFooter::new(format!(
            "Guild ID: {} • User ID: {}",
            n.guild_id, n.user_id
        )));

    match serenity::Timestamp::from_unix_timestamp(n.updated_at.timestamp()) {
        Ok(ts) => embed.timestamp(ts),
        Err(_) => embed,
    }
}
