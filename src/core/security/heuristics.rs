// Fast deterministic checks run before any AI call.
//
// Each check contributes a weight; the sum is capped at 1.0. Whether the
// result is "firm" is decided by the orchestrator against the guild's
// confidence threshold.

use super::security_models::{MemberProfile, SecurityConfig};
use chrono::{DateTime, Utc};

const KEYWORD_WEIGHT: f64 = 0.75;
const EXTRA_KEYWORD_WEIGHT: f64 = 0.05;
const RATE_WEIGHT: f64 = 0.5;
const NEW_ACCOUNT_WEIGHT: f64 = 0.3;
const BRAND_NEW_ACCOUNT_WEIGHT: f64 = 0.4;
const NEW_ACCOUNT_LINK_WEIGHT: f64 = 0.2;
const MASS_MENTION_WEIGHT: f64 = 0.3;

/// Inputs for one heuristic pass.
#[derive(Debug, Clone)]
pub struct HeuristicInput<'a> {
    /// Message text, `None` for join triggers
    pub content: Option<&'a str>,
    pub profile: &'a MemberProfile,
    /// Messages seen from this member inside the rate window, including this one
    pub recent_message_count: usize,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicVerdict {
    pub confidence: f64,
    pub reasons: Vec<String>,
}

impl HeuristicVerdict {
    pub fn clean() -> Self {
        Self {
            confidence: 0.0,
            reasons: Vec::new(),
        }
    }
}

/// Run every heuristic against the input.
pub fn evaluate(config: &SecurityConfig, input: &HeuristicInput<'_>) -> HeuristicVerdict {
    let mut confidence = 0.0;
    let mut reasons = Vec::new();

    let content = input.content.map(|c| c.to_lowercase());

    if let Some(content) = content.as_deref() {
        let hits: Vec<&String> = config
            .keywords
            .iter()
            .filter(|k| !k.trim().is_empty() && content.contains(&k.trim().to_lowercase()))
            .collect();

        if let Some(first) = hits.first() {
            confidence += KEYWORD_WEIGHT + EXTRA_KEYWORD_WEIGHT * (hits.len() - 1) as f64;
            if hits.len() == 1 {
                reasons.push(format!("Matched keyword \"{}\"", first));
            } else {
                let list: Vec<&str> = hits.iter().map(|k| k.as_str()).collect();
                reasons.push(format!("Matched keywords: {}", list.join(", ")));
            }
        }

        if input.recent_message_count > config.max_messages_per_window as usize {
            confidence += RATE_WEIGHT;
            reasons.push(format!(
                "Sent {} messages in {} seconds",
                input.recent_message_count, config.rate_window_secs
            ));
        }

        if content.contains("@everyone") || content.contains("@here") {
            confidence += MASS_MENTION_WEIGHT;
            reasons.push("Attempted mass mention".to_string());
        }
    }

    let age = input.now - input.profile.account_created_at;
    let is_new = age < chrono::Duration::days(config.min_account_age_days as i64);
    if is_new {
        if age < chrono::Duration::days(1) {
            confidence += BRAND_NEW_ACCOUNT_WEIGHT;
            reasons.push("Account created less than a day ago".to_string());
        } else {
            confidence += NEW_ACCOUNT_WEIGHT;
            reasons.push(format!("Account is {} days old", age.num_days()));
        }

        let has_link = content
            .as_deref()
            .map(|c| c.contains("http://") || c.contains("https://") || c.contains("discord.gg/"))
            .unwrap_or(false);
        if has_link {
            confidence += NEW_ACCOUNT_LINK_WEIGHT;
            reasons.push("New account posted a link".to_string());
        }
    }

    HeuristicVerdict {
        confidence: confidence.min(1.0),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(age_days: i64) -> MemberProfile {
        MemberProfile {
            user_id: 1,
            username: "someone".to_string(),
            account_created_at: Utc::now() - chrono::Duration::days(age_days),
            joined_at: None,
            is_bot: false,
            avatar_url: None,
        }
    }

    fn input<'a>(content: Option<&'a str>, profile: &'a MemberProfile, count: usize) -> HeuristicInput<'a> {
        HeuristicInput {
            content,
            profile,
            recent_message_count: count,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_clean_message_from_old_account() {
        let p = profile(400);
        let verdict = evaluate(&SecurityConfig::default(), &input(Some("good morning"), &p, 1));
        assert_eq!(verdict, HeuristicVerdict::clean());
    }

    #[test]
    fn test_keyword_is_case_insensitive() {
        let p = profile(400);
        let verdict = evaluate(
            &SecurityConfig::default(),
            &input(Some("Get FREE NITRO here"), &p, 1),
        );
        assert!((verdict.confidence - KEYWORD_WEIGHT).abs() < f64::EPSILON);
        assert_eq!(verdict.reasons, vec!["Matched keyword \"free nitro\"".to_string()]);
    }

    #[test]
    fn test_rate_limit_and_new_account_stack() {
        let p = profile(0);
        let config = SecurityConfig::default();
        let verdict = evaluate(
            &config,
            &input(Some("check https://x.example"), &p, config.max_messages_per_window as usize + 1),
        );
        let expected = RATE_WEIGHT + BRAND_NEW_ACCOUNT_WEIGHT + NEW_ACCOUNT_LINK_WEIGHT;
        assert!((verdict.confidence - expected.min(1.0)).abs() < 1e-9);
        assert_eq!(verdict.reasons.len(), 3);
    }

    #[test]
    fn test_join_only_scores_account_age() {
        let p = profile(3);
        let verdict = evaluate(&SecurityConfig::default(), &input(None, &p, 0));
        assert!((verdict.confidence - NEW_ACCOUNT_WEIGHT).abs() < f64::EPSILON);
        assert_eq!(verdict.reasons, vec!["Account is 3 days old".to_string()]);
    }

    #[test]
    fn test_confidence_is_capped() {
        let p = profile(0);
        let config = SecurityConfig::default();
        let verdict = evaluate(
            &config,
            &input(Some("free nitro airdrop @everyone https://scam"), &p, 50),
        );
        assert_eq!(verdict.confidence, 1.0);
    }
}
