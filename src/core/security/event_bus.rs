// In-process publish/subscribe for the security pipeline.
//
// Events are a closed enum, so every payload shape is checked at compile
// time. Handlers for one publish run in subscription order and are awaited
// one after another; a failing handler is logged and skipped.

use super::security_models::{CaseStatus, DetectionResult, MessageRef, VerificationCase};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum SecurityEvent {
    /// A new pending case was created for a member.
    CaseOpened {
        guild_id: u64,
        user_id: u64,
        case: VerificationCase,
        detection: DetectionResult,
    },
    /// A new signal was merged into an already pending case.
    AdditionalSuspicionDetected {
        guild_id: u64,
        user_id: u64,
        case: VerificationCase,
        detection: DetectionResult,
        source: Option<MessageRef>,
    },
    CaseVerified {
        guild_id: u64,
        user_id: u64,
        moderator_id: u64,
        case_id: u64,
        notes: Option<String>,
    },
    CaseBanned {
        guild_id: u64,
        user_id: u64,
        moderator_id: u64,
        reason: String,
        case_id: u64,
    },
    CaseReopened {
        case_id: u64,
        guild_id: u64,
        user_id: u64,
        moderator_id: u64,
        previous_status: CaseStatus,
        notes: Option<String>,
    },
}

/// Discriminant of `SecurityEvent`, used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityEventKind {
    CaseOpened,
    AdditionalSuspicionDetected,
    CaseVerified,
    CaseBanned,
    CaseReopened,
}

impl SecurityEvent {
    pub fn kind(&self) -> SecurityEventKind {
        match self {
            SecurityEvent::CaseOpened { .. } => SecurityEventKind::CaseOpened,
            SecurityEvent::AdditionalSuspicionDetected { .. } => {
                SecurityEventKind::AdditionalSuspicionDetected
            }
            SecurityEvent::CaseVerified { .. } => SecurityEventKind::CaseVerified,
            SecurityEvent::CaseBanned { .. } => SecurityEventKind::CaseBanned,
            SecurityEvent::CaseReopened { .. } => SecurityEventKind::CaseReopened,
        }
    }

    pub fn case_id(&self) -> u64 {
        match self {
            SecurityEvent::CaseOpened { case, .. }
            | SecurityEvent::AdditionalSuspicionDetected { case, .. } => case.id,
            SecurityEvent::CaseVerified { case_id, .. }
            | SecurityEvent::CaseBanned { case_id, .. }
            | SecurityEvent::CaseReopened { case_id, .. } => *case_id,
        }
    }
}

/// A subscriber performing one side effect.
#[async_trait]
pub trait SecurityEventHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Event kinds this handler wants. Used by `EventBus::register`.
    fn kinds(&self) -> &'static [SecurityEventKind];

    async fn handle(&self, event: &SecurityEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

type Subscription = (SubscriptionId, Arc<dyn SecurityEventHandler>);

pub struct EventBus {
    handlers: DashMap<SecurityEventKind, Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for one event kind.
    pub fn subscribe(
        &self,
        kind: SecurityEventKind,
        handler: Arc<dyn SecurityEventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.entry(kind).or_default().push((id, handler));
        id
    }

    /// Register `handler` for every kind it declares.
    pub fn register(&self, handler: Arc<dyn SecurityEventHandler>) -> Vec<SubscriptionId> {
        handler
            .kinds()
            .iter()
            .map(|kind| self.subscribe(*kind, Arc::clone(&handler)))
            .collect()
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut entry in self.handlers.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|(sub_id, _)| *sub_id != id);
            removed |= entry.value().len() != before;
        }
        removed
    }

    pub fn handler_count(&self, kind: SecurityEventKind) -> usize {
        self.handlers.get(&kind).map(|h| h.len()).unwrap_or(0)
    }

    /// Deliver `event` to every handler subscribed to its kind.
    pub async fn publish(&self, event: SecurityEvent) -> PublishReport {
        let kind = event.kind();

        // Snapshot so no map guard is held across an await point.
        let handlers: Vec<Arc<dyn SecurityEventHandler>> = self
            .handlers
            .get(&kind)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        let mut report = PublishReport::default();
        for handler in handlers {
            match handler.handle(&event).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        handler = handler.name(),
                        event = ?kind,
                        case_id = event.case_id(),
                        "Security event handler failed: {:#}",
                        e
                    );
                }
            }
        }

        tracing::debug!(
            event = ?kind,
            delivered = report.delivered,
            failed = report.failed,
            "Published security event"
        );
        report
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl SecurityEventHandler for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn kinds(&self) -> &'static [SecurityEventKind] {
            &[SecurityEventKind::CaseVerified, SecurityEventKind::CaseBanned]
        }

        async fn handle(&self, _event: &SecurityEvent) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("{} exploded", self.name);
            }
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> Arc<dyn SecurityEventHandler> {
        Arc::new(Recorder {
            name,
            log: Arc::clone(log),
            fail,
        })
    }

    fn verified() -> SecurityEvent {
        SecurityEvent::CaseVerified {
            guild_id: 1,
            user_id: 2,
            moderator_id: 3,
            case_id: 4,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(SecurityEventKind::CaseVerified, recorder("first", &log, false));
        bus.subscribe(SecurityEventKind::CaseVerified, recorder("second", &log, false));
        bus.subscribe(SecurityEventKind::CaseVerified, recorder("third", &log, false));

        let report = bus.publish(verified()).await;

        assert_eq!(report.delivered, 3);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(SecurityEventKind::CaseVerified, recorder("broken", &log, true));
        bus.subscribe(SecurityEventKind::CaseVerified, recorder("healthy", &log, false));

        let report = bus.publish(verified()).await;

        assert_eq!(report, PublishReport { delivered: 1, failed: 1 });
        assert_eq!(*log.lock().unwrap(), vec!["broken", "healthy"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_kind_routing() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let ids = bus.register(recorder("both", &log, false));
        assert_eq!(ids.len(), 2);
        assert_eq!(bus.handler_count(SecurityEventKind::CaseBanned), 1);
        assert_eq!(bus.handler_count(SecurityEventKind::CaseOpened), 0);

        assert!(bus.unsubscribe(ids[0]));
        assert!(!bus.unsubscribe(ids[0]));

        let report = bus.publish(verified()).await;
        assert_eq!(report.delivered, 0);

        let report = bus
            .publish(SecurityEvent::CaseBanned {
                guild_id: 1,
                user_id: 2,
                moderator_id: 3,
                reason: "spam".to_string(),
                case_id: 4,
            })
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["both"]);
    }
}
