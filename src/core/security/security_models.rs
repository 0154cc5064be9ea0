// Security domain models - suspicion signals, verification cases and audit entries.
//
// These are pure domain types with no Discord dependencies.
// The Discord layer converts them to embeds and API calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a suspicion signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    /// A chat message was flagged
    Message,
    /// A new member joined
    Join,
    /// A member reported another member
    Report,
    /// A moderator flagged the member by hand
    Manual,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Message => "MESSAGE",
            SignalType::Join => "JOIN",
            SignalType::Report => "REPORT",
            SignalType::Manual => "MANUAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MESSAGE" => Some(SignalType::Message),
            "JOIN" => Some(SignalType::Join),
            "REPORT" => Some(SignalType::Report),
            "MANUAL" => Some(SignalType::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalType::Message => write!(f, "Message"),
            SignalType::Join => write!(f, "Join"),
            SignalType::Report => write!(f, "Report"),
            SignalType::Manual => write!(f, "Manual"),
        }
    }
}

/// Verdict label shared by classifiers and the fused result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectionLabel {
    Ok,
    Suspicious,
}

/// Lifecycle status of a verification case.
///
/// `Pending` is the only non-terminal state. `Verified` and `Banned` can only
/// leave through a moderator reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CaseStatus {
    Pending,
    Verified,
    Banned,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Pending => "PENDING",
            CaseStatus::Verified => "VERIFIED",
            CaseStatus::Banned => "BANNED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(CaseStatus::Pending),
            "VERIFIED" => Some(CaseStatus::Verified),
            "BANNED" => Some(CaseStatus::Banned),
            _ => None,
        }
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of moderator action recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminActionType {
    Verify,
    Ban,
    Reopen,
    CreateThread,
}

impl AdminActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminActionType::Verify => "VERIFY",
            AdminActionType::Ban => "BAN",
            AdminActionType::Reopen => "REOPEN",
            AdminActionType::CreateThread => "CREATE_THREAD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "VERIFY" => Some(AdminActionType::Verify),
            "BAN" => Some(AdminActionType::Ban),
            "REOPEN" => Some(AdminActionType::Reopen),
            "CREATE_THREAD" => Some(AdminActionType::CreateThread),
            _ => None,
        }
    }
}

/// Reference to a message on the platform (channel + message id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: u64,
    pub message_id: u64,
}

/// What we know about an actor when a trigger fires.
#[derive(Debug, Clone)]
pub struct MemberProfile {
    pub user_id: u64,
    pub username: String,
    pub account_created_at: DateTime<Utc>,
    pub joined_at: Option<DateTime<Utc>>,
    pub is_bot: bool,
    pub avatar_url: Option<String>,
}

/// The fused verdict for one trigger.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub label: DetectionLabel,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub trigger_source: SignalType,
    pub trigger_content: Option<String>,
    /// Set once the matching `DetectionEvent` has been persisted
    pub detection_event_id: Option<u64>,
    pub source: Option<MessageRef>,
}

impl DetectionResult {
    pub fn is_suspicious(&self) -> bool {
        self.label == DetectionLabel::Suspicious
    }
}

/// Immutable record of one suspicion signal.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub id: u64,
    pub guild_id: u64,
    pub user_id: u64,
    pub signal_type: SignalType,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub detected_at: DateTime<Utc>,
    pub message_ref: Option<MessageRef>,
    /// Back-reference to the case this signal most recently affected
    pub case_id: Option<u64>,
}

/// Insert form of a `DetectionEvent`.
#[derive(Debug, Clone)]
pub struct NewDetectionEvent {
    pub guild_id: u64,
    pub user_id: u64,
    pub signal_type: SignalType,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub detected_at: DateTime<Utc>,
    pub message_ref: Option<MessageRef>,
}

impl NewDetectionEvent {
    pub fn from_result(guild_id: u64, user_id: u64, result: &DetectionResult) -> Self {
        Self {
            guild_id,
            user_id,
            signal_type: result.trigger_source,
            confidence: result.confidence,
            reasons: result.reasons.clone(),
            detected_at: Utc::now(),
            message_ref: result.source,
        }
    }
}

// Signal summaries kept on a case are capped so the notification stays readable.
pub const MAX_CASE_SIGNALS: usize = 10;

/// Opaque per-case bookkeeping, stored as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseMetadata {
    pub detection_count: u32,
    pub last_confidence: f64,
    pub last_detection_event_id: Option<u64>,
    pub signals: Vec<String>,
}

impl CaseMetadata {
    /// Metadata for a case opened by `result`.
    pub fn opened_by(result: &DetectionResult) -> Self {
        let mut metadata = Self::default();
        metadata.record(result);
        metadata
    }

    /// Fold another detection into the metadata.
    pub fn record(&mut self, result: &DetectionResult) {
        self.detection_count = self.detection_count.saturating_add(1);
        self.last_confidence = result.confidence;
        self.last_detection_event_id = result.detection_event_id;

        let summary = match result.reasons.first() {
            Some(reason) => format!("{}: {}", result.trigger_source, reason),
            None => result.trigger_source.to_string(),
        };
        self.signals.push(summary);
        if self.signals.len() > MAX_CASE_SIGNALS {
            let overflow = self.signals.len() - MAX_CASE_SIGNALS;
            self.signals.drain(..overflow);
        }
    }
}

/// The durable unit of work tracking one suspicion episode.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationCase {
    pub id: u64,
    pub guild_id: u64,
    pub user_id: u64,
    pub detection_event_id: Option<u64>,
    pub notification: Option<MessageRef>,
    pub thread_id: Option<u64>,
    pub status: CaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<u64>,
    pub notes: String,
    pub metadata: CaseMetadata,
}

/// Insert form of a `VerificationCase`. New cases always start `Pending`.
#[derive(Debug, Clone)]
pub struct NewVerificationCase {
    pub guild_id: u64,
    pub user_id: u64,
    pub detection_event_id: Option<u64>,
    pub notes: String,
    pub metadata: CaseMetadata,
    pub created_at: DateTime<Utc>,
}

/// Partial update applied to a case, guarded by its expected status.
#[derive(Debug, Clone, Default)]
pub struct CaseUpdate {
    pub notes: Option<String>,
    pub metadata: Option<CaseMetadata>,
    pub thread_id: Option<u64>,
}

/// Append-only audit entry for a moderator-driven change.
#[derive(Debug, Clone, PartialEq)]
pub struct AdminAction {
    pub id: u64,
    pub guild_id: u64,
    pub user_id: u64,
    pub moderator_id: u64,
    pub case_id: u64,
    pub action_type: AdminActionType,
    pub created_at: DateTime<Utc>,
    pub previous_status: CaseStatus,
    pub new_status: CaseStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAdminAction {
    pub guild_id: u64,
    pub user_id: u64,
    pub moderator_id: u64,
    pub case_id: u64,
    pub action_type: AdminActionType,
    pub previous_status: CaseStatus,
    pub new_status: CaseStatus,
    pub notes: Option<String>,
}

/// Denormalized membership view kept in sync by the member-status subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberStatus {
    pub guild_id: u64,
    pub user_id: u64,
    pub restricted: bool,
    pub verification_status: Option<CaseStatus>,
    pub last_status_change: Option<DateTime<Utc>>,
    pub reputation: i64,
}

impl MemberStatus {
    pub fn new(guild_id: u64, user_id: u64) -> Self {
        Self {
            guild_id,
            user_id,
            restricted: false,
            verification_status: None,
            last_status_change: None,
            reputation: 0,
        }
    }
}

/// Longest message-rate window a guild may configure (one day).
pub const MAX_RATE_WINDOW_SECS: u64 = 86_400;
/// Highest message count a guild may allow per rate window.
pub const MAX_MESSAGES_PER_WINDOW: u32 = 50;

/// Per-guild detection and enforcement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Whether detection runs at all for this guild
    pub enabled: bool,
    /// Confidence at or above which a verdict is suspicious
    pub confidence_threshold: f64,
    /// Heuristic confidence at or above which the AI classifier is consulted
    pub ai_review_floor: f64,
    /// Case-insensitive keywords that count as a firm heuristic hit
    pub keywords: Vec<String>,
    /// Apply the restricted role as soon as a case opens
    pub auto_restrict: bool,
    /// Accounts younger than this are treated as new
    pub min_account_age_days: u32,
    /// Maximum messages allowed in the rate window
    pub max_messages_per_window: u32,
    /// Rate window in seconds
    pub rate_window_secs: u64,
    /// Role applied while a case is pending
    pub restricted_role_id: Option<u64>,
    /// Channel where moderation notifications are posted
    pub alert_channel_id: Option<u64>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.7,
            ai_review_floor: 0.2,
            keywords: vec![
                "free nitro".to_string(),
                "steam gift".to_string(),
                "airdrop".to_string(),
                "claim your reward".to_string(),
            ],
            auto_restrict: true,
            min_account_age_days: 7,
            max_messages_per_window: 6,
            rate_window_secs: 10,
            restricted_role_id: None,
            alert_channel_id: None,
        }
    }
}
