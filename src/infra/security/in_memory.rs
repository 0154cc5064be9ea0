// In-memory implementation of every security store port.
//
// Used by the test suite and when running with SECURITY_STORAGE=memory.
// Cases live behind one mutex so the one-pending-case-per-member rule is
// checked and applied atomically, the same guarantee the SQLite partial
// unique index gives.

use crate::core::security::case_state::apply_change;
use crate::core::security::{
    AdminAction, AdminActionStore, CaseStatus, CaseStore, CaseUpdate, DetectionEvent,
    DetectionEventStore, MemberStatus, MemberStore, MessageRef, NewAdminAction,
    NewDetectionEvent, NewVerificationCase, SecurityConfig, SecurityConfigStore, SecurityError,
    StatusChange, VerificationCase,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct CaseTable {
    // BTreeMap keeps ids ordered, which gives us "newest first" for free.
    cases: BTreeMap<u64, VerificationCase>,
    next_id: u64,
}

impl CaseTable {
    fn pending_for(&self, guild_id: u64, user_id: u64) -> Option<&VerificationCase> {
        self.cases.values().find(|c| {
            c.guild_id == guild_id && c.user_id == user_id && c.status == CaseStatus::Pending
        })
    }
}

pub struct InMemorySecurityStore {
    configs: DashMap<u64, SecurityConfig>,
    members: DashMap<(u64, u64), MemberStatus>,
    cases: Mutex<CaseTable>,
    detection_events: DashMap<u64, DetectionEvent>,
    admin_actions: DashMap<u64, AdminAction>,
    next_event_id: AtomicU64,
    next_action_id: AtomicU64,
}

impl InMemorySecurityStore {
    pub fn new() -> Self {
        Self {
            configs: DashMap::new(),
            members: DashMap::new(),
            cases: Mutex::new(CaseTable {
                cases: BTreeMap::new(),
                next_id: 1,
            }),
            detection_events: DashMap::new(),
            admin_actions: DashMap::new(),
            next_event_id: AtomicU64::new(1),
            next_action_id: AtomicU64::new(1),
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, CaseTable>, SecurityError> {
        self.cases
            .lock()
            .map_err(|_| SecurityError::StorageError("case table lock poisoned".to_string()))
    }

    /// Total number of cases, any status.
    #[cfg(test)]
    pub fn case_count(&self) -> usize {
        self.table().map(|t| t.cases.len()).unwrap_or(0)
    }

    /// Number of pending cases for one member. Never more than one.
    #[cfg(test)]
    pub fn pending_count(&self, guild_id: u64, user_id: u64) -> usize {
        self.table()
            .map(|t| {
                t.cases
                    .values()
                    .filter(|c| {
                        c.guild_id == guild_id
                            && c.user_id == user_id
                            && c.status == CaseStatus::Pending
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn find_detection_event(&self, event_id: u64) -> Option<DetectionEvent> {
        self.detection_events.get(&event_id).map(|e| e.clone())
    }
}

impl Default for InMemorySecurityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaseStore for InMemorySecurityStore {
    async fn find_active_pending(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<VerificationCase>, SecurityError> {
        Ok(self.table()?.pending_for(guild_id, user_id).cloned())
    }

    async fn create(&self, case: NewVerificationCase) -> Result<VerificationCase, SecurityError> {
        let mut table = self.table()?;
        if table.pending_for(case.guild_id, case.user_id).is_some() {
            return Err(SecurityError::ActiveCaseExists {
                guild_id: case.guild_id,
                user_id: case.user_id,
            });
        }

        let id = table.next_id;
        table.next_id += 1;

        let stored = VerificationCase {
            id,
            guild_id: case.guild_id,
            user_id: case.user_id,
            detection_event_id: case.detection_event_id,
            notification: None,
            thread_id: None,
            status: CaseStatus::Pending,
            created_at: case.created_at,
            updated_at: case.created_at,
            resolved_at: None,
            resolved_by: None,
            notes: case.notes,
            metadata: case.metadata,
        };
        table.cases.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update_status(
        &self,
        case_id: u64,
        expected: CaseStatus,
        change: StatusChange,
    ) -> Result<Option<VerificationCase>, SecurityError> {
        let mut table = self.table()?;

        let (guild_id, user_id) = match table.cases.get(&case_id) {
            Some(case) if case.status == expected => (case.guild_id, case.user_id),
            _ => return Ok(None),
        };

        if change.new_status == CaseStatus::Pending {
            if let Some(other) = table.pending_for(guild_id, user_id) {
                if other.id != case_id {
                    return Err(SecurityError::ActiveCaseExists { guild_id, user_id });
                }
            }
        }

        Ok(table.cases.get_mut(&case_id).map(|case| {
            apply_change(case, &change);
            case.clone()
        }))
    }

    async fn update(
        &self,
        case_id: u64,
        expected: CaseStatus,
        update: CaseUpdate,
    ) -> Result<Option<VerificationCase>, SecurityError> {
        let mut table = self.table()?;
        let Some(case) = table.cases.get_mut(&case_id) else {
            return Ok(None);
        };
        if case.status != expected {
            return Ok(None);
        }

        if let Some(notes) = update.notes {
            case.notes = notes;
        }
        if let Some(metadata) = update.metadata {
            case.metadata = metadata;
        }
        if case.thread_id.is_none() {
            case.thread_id = update.thread_id;
        }
        case.updated_at = Utc::now();
        Ok(Some(case.clone()))
    }

    async fn link_notification(
        &self,
        case_id: u64,
        notification: MessageRef,
    ) -> Result<bool, SecurityError> {
        let mut table = self.table()?;
        match table.cases.get_mut(&case_id) {
            Some(case) if case.notification.is_none() => {
                case.notification = Some(notification);
                case.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_by_id(&self, case_id: u64) -> Result<Option<VerificationCase>, SecurityError> {
        Ok(self.table()?.cases.get(&case_id).cloned())
    }

    async fn find_latest(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<VerificationCase>, SecurityError> {
        Ok(self
            .table()?
            .cases
            .values()
            .rev()
            .find(|c| c.guild_id == guild_id && c.user_id == user_id)
            .cloned())
    }

    async fn list_for_member(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Vec<VerificationCase>, SecurityError> {
        Ok(self
            .table()?
            .cases
            .values()
            .rev()
            .filter(|c| c.guild_id == guild_id && c.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DetectionEventStore for InMemorySecurityStore {
    async fn create(&self, event: NewDetectionEvent) -> Result<DetectionEvent, SecurityError> {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let stored = DetectionEvent {
            id,
            guild_id: event.guild_id,
            user_id: event.user_id,
            signal_type: event.signal_type,
            confidence: event.confidence,
            reasons: event.reasons,
            detected_at: event.detected_at,
            message_ref: event.message_ref,
            case_id: None,
        };
        self.detection_events.insert(id, stored.clone());
        Ok(stored)
    }

    async fn link_case(&self, event_id: u64, case_id: u64) -> Result<(), SecurityError> {
        if let Some(mut event) = self.detection_events.get_mut(&event_id) {
            event.case_id = Some(case_id);
        }
        Ok(())
    }

    async fn find_by_id(&self, event_id: u64) -> Result<Option<DetectionEvent>, SecurityError> {
        Ok(self.find_detection_event(event_id))
    }
}

#[async_trait]
impl AdminActionStore for InMemorySecurityStore {
    async fn create(&self, action: NewAdminAction) -> Result<AdminAction, SecurityError> {
        let id = self.next_action_id.fetch_add(1, Ordering::SeqCst);
        let stored = AdminAction {
            id,
            guild_id: action.guild_id,
            user_id: action.user_id,
            moderator_id: action.moderator_id,
            case_id: action.case_id,
            action_type: action.action_type,
            created_at: Utc::now(),
            previous_status: action.previous_status,
            new_status: action.new_status,
            notes: action.notes,
        };
        self.admin_actions.insert(id, stored.clone());
        Ok(stored)
    }

    async fn find_by_case(&self, case_id: u64) -> Result<Vec<AdminAction>, SecurityError> {
        let mut actions: Vec<AdminAction> = self
            .admin_actions
            .iter()
            .filter(|a| a.case_id == case_id)
            .map(|a| a.clone())
            .collect();
        actions.sort_by_key(|a| a.id);
        Ok(actions)
    }
}

#[async_trait]
impl SecurityConfigStore for InMemorySecurityStore {
    async fn get_config(&self, guild_id: u64) -> Result<SecurityConfig, SecurityError> {
        Ok(self
            .configs
            .get(&guild_id)
            .map(|c| c.clone())
            .unwrap_or_default())
    }

    async fn save_config(&self, guild_id: u64, config: SecurityConfig) -> Result<(), SecurityError> {
        self.configs.insert(guild_id, config);
        Ok(())
    }
}

#[async_trait]
impl MemberStore for InMemorySecurityStore {
    async fn ensure_member(&self, guild_id: u64, user_id: u64) -> Result<(), SecurityError> {
        self.members
            .entry((guild_id, user_id))
            .or_insert_with(|| MemberStatus::new(guild_id, user_id));
        Ok(())
    }

    async fn get_status(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<MemberStatus>, SecurityError> {
        Ok(self.members.get(&(guild_id, user_id)).map(|m| m.clone()))
    }

    async fn update_status(
        &self,
        guild_id: u64,
        user_id: u64,
        restricted: bool,
        verification_status: CaseStatus,
        changed_at: DateTime<Utc>,
    ) -> Result<(), SecurityError> {
        let mut member = self
            .members
            .entry((guild_id, user_id))
            .or_insert_with(|| MemberStatus::new(guild_id, user_id));
        member.restricted = restricted;
        member.verification_status = Some(verification_status);
        member.last_status_change = Some(changed_at);
        Ok(())
    }

    async fn adjust_reputation(
        &self,
        guild_id: u64,
        user_id: u64,
        delta: i64,
    ) -> Result<i64, SecurityError> {
        let mut member = self
            .members
            .entry((guild_id, user_id))
            .or_insert_with(|| MemberStatus::new(guild_id, user_id));
        member.reputation = member.reputation.saturating_add(delta);
        Ok(member.reputation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::CaseMetadata;

    fn new_case(user_id: u64) -> NewVerificationCase {
        NewVerificationCase {
            guild_id: 1,
            user_id,
            detection_event_id: None,
            notes: String::new(),
            metadata: CaseMetadata::default(),
            created_at: Utc::now(),
        }
    }

    fn change(new_status: CaseStatus) -> StatusChange {
        StatusChange {
            new_status,
            resolved_at: None,
            resolved_by: None,
            updated_at: Utc::now(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_one_pending_case_per_member() {
        let store = InMemorySecurityStore::new();
        let first = CaseStore::create(&store, new_case(2)).await.unwrap();

        let err = CaseStore::create(&store, new_case(2)).await.unwrap_err();
        assert!(matches!(err, SecurityError::ActiveCaseExists { user_id: 2, .. }));

        CaseStore::update_status(&store, first.id, CaseStatus::Pending, change(CaseStatus::Banned))
            .await
            .unwrap()
            .unwrap();
        let second = CaseStore::create(&store, new_case(2)).await.unwrap();

        // Reopening the old case would make two pending cases
        let err = CaseStore::update_status(&store, first.id, CaseStatus::Banned, change(CaseStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::ActiveCaseExists { .. }));

        assert_eq!(store.pending_count(1, 2), 1);
        assert_eq!(store.find_latest(1, 2).await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_status_guard() {
        let store = InMemorySecurityStore::new();
        let case = CaseStore::create(&store, new_case(2)).await.unwrap();

        let stale = CaseStore::update_status(&store, case.id, CaseStatus::Verified, change(CaseStatus::Banned))
            .await
            .unwrap();
        assert!(stale.is_none());

        let missing = CaseStore::update_status(&store, 999, CaseStatus::Pending, change(CaseStatus::Banned))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_reputation_creates_member() {
        let store = InMemorySecurityStore::new();
        assert_eq!(store.adjust_reputation(1, 2, -5).await.unwrap(), -5);
        assert_eq!(store.adjust_reputation(1, 2, 1).await.unwrap(), -4);

        let status = store.get_status(1, 2).await.unwrap().unwrap();
        assert_eq!(status.reputation, -4);
        assert!(!status.restricted);
    }
}
