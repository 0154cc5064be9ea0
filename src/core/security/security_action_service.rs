// Security action service - turns a suspicious verdict into case state.
//
// For each suspicious DetectionResult this service:
// - makes sure the member row exists
// - makes sure the DetectionEvent is persisted
// - opens a new pending case, or merges into the member's active one
// - publishes CaseOpened / AdditionalSuspicionDetected
//
// The lookup and the create-or-merge run under the member's actor lock, and
// the event is published before the lock is released, so a second trigger
// always sees the first case together with its notification link.

use super::actor_locks::ActorLocks;
use super::event_bus::{EventBus, SecurityEvent};
use super::security_models::{
    CaseMetadata, CaseStatus, CaseUpdate, DetectionResult, MessageRef, NewDetectionEvent,
    NewVerificationCase, VerificationCase,
};
use super::security_store::{CaseStore, DetectionEventStore, MemberStore, SecurityError};
use chrono::Utc;
use std::sync::Arc;

/// What `handle_suspicion` did with a verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspicionOutcome {
    /// The verdict was not suspicious; nothing changed
    Ignored,
    /// A new pending case was opened
    Opened(VerificationCase),
    /// The signal was folded into the member's existing pending case
    Merged(VerificationCase),
}

impl SuspicionOutcome {
    pub fn case(&self) -> Option<&VerificationCase> {
        match self {
            SuspicionOutcome::Ignored => None,
            SuspicionOutcome::Opened(case) | SuspicionOutcome::Merged(case) => Some(case),
        }
    }
}

pub struct SecurityActionService {
    cases: Arc<dyn CaseStore>,
    events: Arc<dyn DetectionEventStore>,
    members: Arc<dyn MemberStore>,
    bus: Arc<EventBus>,
    locks: Arc<ActorLocks>,
}

impl SecurityActionService {
    pub fn new(
        cases: Arc<dyn CaseStore>,
        events: Arc<dyn DetectionEventStore>,
        members: Arc<dyn MemberStore>,
        bus: Arc<EventBus>,
        locks: Arc<ActorLocks>,
    ) -> Self {
        Self {
            cases,
            events,
            members,
            bus,
            locks,
        }
    }

    /// Open or merge a case for a suspicious verdict.
    ///
    /// Non-suspicious verdicts are ignored. Calling this N times for a member
    /// with a pending case never creates a second case.
    pub async fn handle_suspicion(
        &self,
        guild_id: u64,
        user_id: u64,
        mut detection: DetectionResult,
        source: Option<MessageRef>,
    ) -> Result<SuspicionOutcome, SecurityError> {
        if !detection.is_suspicious() {
            return Ok(SuspicionOutcome::Ignored);
        }

        self.members.ensure_member(guild_id, user_id).await?;

        if detection.source.is_none() {
            detection.source = source;
        }

        if detection.detection_event_id.is_none() {
            let event = self
                .events
                .create(NewDetectionEvent::from_result(guild_id, user_id, &detection))
                .await?;
            detection.detection_event_id = Some(event.id);
        }

        let _guard = self.locks.lock(guild_id, user_id).await;

        match self.cases.find_active_pending(guild_id, user_id).await? {
            Some(active) => self.merge(active, detection, source).await,
            None => match self.open(guild_id, user_id, &detection).await {
                Ok(case) => self.announce_opened(case, detection).await,
                // The datastore guard caught a pending case we did not see
                // (another process). Merge into it instead.
                Err(SecurityError::ActiveCaseExists { .. }) => {
                    tracing::warn!(guild_id, user_id, "Pending case appeared concurrently, merging");
                    let active = self
                        .cases
                        .find_active_pending(guild_id, user_id)
                        .await?
                        .ok_or(SecurityError::ActiveCaseExists { guild_id, user_id })?;
                    self.merge(active, detection, source).await
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn open(
        &self,
        guild_id: u64,
        user_id: u64,
        detection: &DetectionResult,
    ) -> Result<VerificationCase, SecurityError> {
        self.cases
            .create(NewVerificationCase {
                guild_id,
                user_id,
                detection_event_id: detection.detection_event_id,
                notes: String::new(),
                metadata: CaseMetadata::opened_by(detection),
                created_at: Utc::now(),
            })
            .await
    }

    async fn announce_opened(
        &self,
        case: VerificationCase,
        detection: DetectionResult,
    ) -> Result<SuspicionOutcome, SecurityError> {
        self.link_detection(&detection, case.id).await;

        tracing::info!(
            guild_id = case.guild_id,
            user_id = case.user_id,
            case_id = case.id,
            confidence = detection.confidence,
            source = %detection.trigger_source,
            "Opened security case"
        );

        let case_id = case.id;
        self.bus
            .publish(SecurityEvent::CaseOpened {
                guild_id: case.guild_id,
                user_id: case.user_id,
                case: case.clone(),
                detection,
            })
            .await;

        Ok(SuspicionOutcome::Opened(self.reload(case_id, case).await))
    }

    async fn merge(
        &self,
        active: VerificationCase,
        detection: DetectionResult,
        source: Option<MessageRef>,
    ) -> Result<SuspicionOutcome, SecurityError> {
        let mut metadata = active.metadata.clone();
        metadata.record(&detection);

        let updated = self
            .cases
            .update(
                active.id,
                CaseStatus::Pending,
                CaseUpdate {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?
            .ok_or(SecurityError::Conflict { case_id: active.id })?;

        self.link_detection(&detection, updated.id).await;

        tracing::info!(
            guild_id = updated.guild_id,
            user_id = updated.user_id,
            case_id = updated.id,
            detections = updated.metadata.detection_count,
            "Merged suspicion into pending case"
        );

        let case_id = updated.id;
        self.bus
            .publish(SecurityEvent::AdditionalSuspicionDetected {
                guild_id: updated.guild_id,
                user_id: updated.user_id,
                case: updated.clone(),
                detection,
                source,
            })
            .await;

        Ok(SuspicionOutcome::Merged(self.reload(case_id, updated).await))
    }

    async fn link_detection(&self, detection: &DetectionResult, case_id: u64) {
        if let Some(event_id) = detection.detection_event_id {
            if let Err(e) = self.events.link_case(event_id, case_id).await {
                tracing::warn!(event_id, case_id, "Failed to link detection event to case: {}", e);
            }
        }
    }

    /// Re-read a case after subscribers ran, keeping `fallback` on failure.
    async fn reload(&self, case_id: u64, fallback: VerificationCase) -> VerificationCase {
        match self.cases.find_by_id(case_id).await {
            Ok(Some(case)) => case,
            Ok(None) => fallback,
            Err(e) => {
                tracing::warn!(case_id, "Failed to reload case: {}", e);
                fallback
            }
        }
    }

    /// The member's pending case, if any.
    pub async fn active_case(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<VerificationCase>, SecurityError> {
        self.cases.find_active_pending(guild_id, user_id).await
    }

    /// The member's most recent case, whatever its status.
    pub async fn latest_case(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<VerificationCase>, SecurityError> {
        self.cases.find_latest(guild_id, user_id).await
    }

    /// All of a member's cases, newest first.
    pub async fn case_history(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Vec<VerificationCase>, SecurityError> {
        self.cases.list_for_member(guild_id, user_id).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
