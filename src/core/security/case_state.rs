// Verification case state machine.
//
//   PENDING --verify--> VERIFIED
//   PENDING --ban-----> BANNED
//   VERIFIED | BANNED --reopen--> PENDING
//
// Anything else is an invalid transition. The functions here are pure; the
// actuator applies the resulting `StatusChange` with a status-guarded write.

use super::security_models::{AdminActionType, CaseStatus, VerificationCase};
use super::security_store::{SecurityError, StatusChange};
use chrono::{DateTime, Utc};

/// A moderator-requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseTransition {
    Verify,
    Ban,
    Reopen,
}

impl CaseTransition {
    pub fn name(&self) -> &'static str {
        match self {
            CaseTransition::Verify => "verify",
            CaseTransition::Ban => "ban",
            CaseTransition::Reopen => "reopen",
        }
    }

    pub fn allowed_from(&self, status: CaseStatus) -> bool {
        match self {
            CaseTransition::Verify | CaseTransition::Ban => status == CaseStatus::Pending,
            CaseTransition::Reopen => {
                matches!(status, CaseStatus::Verified | CaseStatus::Banned)
            }
        }
    }

    pub fn target(&self) -> CaseStatus {
        match self {
            CaseTransition::Verify => CaseStatus::Verified,
            CaseTransition::Ban => CaseStatus::Banned,
            CaseTransition::Reopen => CaseStatus::Pending,
        }
    }

    pub fn action_type(&self) -> AdminActionType {
        match self {
            CaseTransition::Verify => AdminActionType::Verify,
            CaseTransition::Ban => AdminActionType::Ban,
            CaseTransition::Reopen => AdminActionType::Reopen,
        }
    }
}

/// Compute the status change for `transition` on `case`.
///
/// Resolving transitions stamp `resolved_at`/`resolved_by`; reopen clears them.
/// Moderator notes are appended to the case notes.
pub fn plan_transition(
    case: &VerificationCase,
    transition: CaseTransition,
    moderator_id: u64,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<StatusChange, SecurityError> {
    if !transition.allowed_from(case.status) {
        return Err(SecurityError::InvalidTransition {
            case_id: case.id,
            from: case.status,
            action: transition.name(),
        });
    }

    let (resolved_at, resolved_by) = match transition {
        CaseTransition::Reopen => (None, None),
        CaseTransition::Verify | CaseTransition::Ban => (Some(now), Some(moderator_id)),
    };

    let notes = notes
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| append_note(&case.notes, transition.action_type(), moderator_id, n));

    Ok(StatusChange {
        new_status: transition.target(),
        resolved_at,
        resolved_by,
        updated_at: now,
        notes,
    })
}

/// Apply a planned change to an in-memory case.
pub fn apply_change(case: &mut VerificationCase, change: &StatusChange) {
    case.status = change.new_status;
    case.resolved_at = change.resolved_at;
    case.resolved_by = change.resolved_by;
    case.updated_at = change.updated_at;
    if let Some(notes) = &change.notes {
        case.notes = notes.clone();
    }
}

fn append_note(existing: &str, action: AdminActionType, moderator_id: u64, note: &str) -> String {
    let line = format!("[{} by {}] {}", action.as_str(), moderator_id, note);
    if existing.is_empty() {
        line
    } else {
        format!("{}\n{}", existing, line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::security_models::CaseMetadata;

    fn case(status: CaseStatus) -> VerificationCase {
        let now = Utc::now();
        VerificationCase {
            id: 1,
            guild_id: 10,
            user_id: 20,
            detection_event_id: None,
            notification: None,
            thread_id: None,
            status,
            created_at: now,
            updated_at: now,
            resolved_at: if status == CaseStatus::Pending { None } else { Some(now) },
            resolved_by: if status == CaseStatus::Pending { None } else { Some(99) },
            notes: String::new(),
            metadata: CaseMetadata::default(),
        }
    }

    #[test]
    fn test_verify_and_ban_resolve_pending_case() {
        let now = Utc::now();
        let change = plan_transition(&case(CaseStatus::Pending), CaseTransition::Verify, 5, None, now)
            .unwrap();
        assert_eq!(change.new_status, CaseStatus::Verified);
        assert_eq!(change.resolved_at, Some(now));
        assert_eq!(change.resolved_by, Some(5));

        let change = plan_transition(
            &case(CaseStatus::Pending),
            CaseTransition::Ban,
            6,
            Some("spam bot"),
            now,
        )
        .unwrap();
        assert_eq!(change.new_status, CaseStatus::Banned);
        assert_eq!(change.notes.as_deref(), Some("[BAN by 6] spam bot"));
    }

    #[test]
    fn test_reopen_clears_resolution() {
        for status in [CaseStatus::Verified, CaseStatus::Banned] {
            let mut c = case(status);
            let change = plan_transition(&c, CaseTransition::Reopen, 5, None, Utc::now()).unwrap();
            apply_change(&mut c, &change);
            assert_eq!(c.status, CaseStatus::Pending);
            assert!(c.resolved_at.is_none());
            assert!(c.resolved_by.is_none());
        }
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let illegal = [
            (CaseStatus::Verified, CaseTransition::Verify),
            (CaseStatus::Verified, CaseTransition::Ban),
            (CaseStatus::Banned, CaseTransition::Verify),
            (CaseStatus::Banned, CaseTransition::Ban),
            (CaseStatus::Pending, CaseTransition::Reopen),
        ];

        for (status, transition) in illegal {
            let err = plan_transition(&case(status), transition, 5, None, Utc::now()).unwrap_err();
            assert!(
                matches!(err, SecurityError::InvalidTransition { from, .. } if from == status),
                "{:?} from {:?} should be invalid",
                transition,
                status
            );
        }
    }

    #[test]
    fn test_notes_are_appended() {
        let mut c = case(CaseStatus::Pending);
        c.notes = "first".to_string();
        let change =
            plan_transition(&c, CaseTransition::Verify, 5, Some("  looks fine "), Utc::now())
                .unwrap();
        assert_eq!(change.notes.as_deref(), Some("first\n[VERIFY by 5] looks fine"));

        let change = plan_transition(&c, CaseTransition::Verify, 5, Some("   "), Utc::now()).unwrap();
        assert!(change.notes.is_none());
    }
}
