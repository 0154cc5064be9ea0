use crate::core::security::{
    ClassifierError, ClassifierInput, ClassifierVerdict, DetectionLabel, SuspicionClassifier,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

const SYSTEM_PROMPT: &str = "You review Discord members for a moderation team. \
Decide whether the member looks like a spammer, scammer or compromised account. \
Reply with a single JSON object and nothing else: \
{\"label\": \"OK\" or \"SUSPICIOUS\", \"confidence\": number between 0 and 1, \"reasons\": [short strings]}. \
confidence is how sure you are of the label you chose.";

/// Suspicion classifier backed by an OpenRouter chat model.
pub struct OpenRouterClassifier {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenRouterClassifier {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
        }
    }
}

fn describe(input: &ClassifierInput) -> String {
    let profile = &input.profile;
    let age_days = (Utc::now() - profile.account_created_at).num_days();

    let mut prompt = format!(
        "Signal: {}\nUsername: {}\nAccount age: {} days\nHas avatar: {}\n",
        input.signal.as_str(),
        profile.username,
        age_days,
        profile.avatar_url.is_some()
    );
    if let Some(joined) = profile.joined_at {
        prompt.push_str(&format!(
            "Joined server: {} hours ago\n",
            (Utc::now() - joined).num_hours()
        ));
    }
    if let Some(content) = &input.content_excerpt {
        prompt.push_str(&format!("Message:\n\"\"\"\n{}\n\"\"\"\n", content));
    }
    if !input.heuristic_reasons.is_empty() {
        prompt.push_str(&format!(
            "Rule-based flags: {}\n",
            input.heuristic_reasons.join("; ")
        ));
    }
    prompt
}

#[derive(Deserialize)]
struct RawVerdict {
    label: String,
    confidence: f64,
    #[serde(default)]
    reasons: Vec<String>,
}

/// Pull the verdict object out of a model reply.
///
/// Models like to wrap JSON in prose or code fences, so only the outermost
/// `{...}` is parsed. Labels are matched case-insensitively.
fn parse_verdict(reply: &str) -> Result<ClassifierVerdict, ClassifierError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => return Err(ClassifierError::Malformed(format!("no JSON object in {:?}", reply))),
    };

    let raw: RawVerdict =
        serde_json::from_str(body).map_err(|e| ClassifierError::Malformed(e.to_string()))?;

    let label = match raw.label.trim().to_ascii_uppercase().as_str() {
        "OK" => DetectionLabel::Ok,
        "SUSPICIOUS" => DetectionLabel::Suspicious,
        other => return Err(ClassifierError::Malformed(format!("unknown label {:?}", other))),
    };

    Ok(ClassifierVerdict {
        label,
        confidence: raw.confidence,
        reasons: raw.reasons,
    })
}

#[async_trait]
impl SuspicionClassifier for OpenRouterClassifier {
    async fn analyze(&self, input: &ClassifierInput) -> Result<ClassifierVerdict, ClassifierError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": describe(input) },
            ],
            "temperature": 0.0,
            "max_tokens": 200,
        });

        let response = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ClassifierError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Request(format!(
                "OpenRouter API error: {} - {}",
                status, text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClassifierError::Malformed(e.to_string()))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ClassifierError::Malformed("missing message content".to_string()))?;

        let verdict = parse_verdict(content)?;
        tracing::debug!(
            guild_id = input.guild_id,
            user_id = input.user_id,
            label = ?verdict.label,
            confidence = verdict.confidence,
            "Classifier verdict"
        );
        Ok(verdict)
    }
}
