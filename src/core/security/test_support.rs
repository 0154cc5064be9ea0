// Test doubles shared by the security service tests.

use super::actor_locks::ActorLocks;
use super::detection_service::{
    ClassifierError, ClassifierInput, ClassifierVerdict, SuspicionClassifier,
};
use super::event_bus::EventBus;
use super::moderation_actuator::ModerationActuator;
use super::platform::{CaseNotification, ModerationPlatform, PlatformError};
use super::security_action_service::SecurityActionService;
use super::security_models::{
    DetectionLabel, DetectionResult, MemberProfile, MessageRef, SecurityConfig, SignalType,
    VerificationCase,
};
use super::security_store::SecurityConfigStore;
use super::subscribers::{register_subscribers, SubscriberDeps};
use crate::infra::security::InMemorySecurityStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GUILD_ID: u64 = 1_000;
pub const RESTRICTED_ROLE_ID: u64 = 555;
pub const ALERT_CHANNEL_ID: u64 = 777;

pub fn profile(user_id: u64, age_days: i64) -> MemberProfile {
    MemberProfile {
        user_id,
        username: format!("user{}", user_id),
        account_created_at: Utc::now() - chrono::Duration::days(age_days),
        joined_at: Some(Utc::now()),
        is_bot: false,
        avatar_url: None,
    }
}

enum StubBehavior {
    Verdict(ClassifierVerdict),
    Fail,
    Hang,
}

pub struct StubClassifier {
    behavior: StubBehavior,
    calls: AtomicUsize,
}

impl StubClassifier {
    fn with(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn suspicious(confidence: f64) -> Self {
        Self::with(StubBehavior::Verdict(ClassifierVerdict {
            label: DetectionLabel::Suspicious,
            confidence,
            reasons: vec!["looks like a scam account".to_string()],
        }))
    }

    pub fn ok(confidence: f64) -> Self {
        Self::with(StubBehavior::Verdict(ClassifierVerdict {
            label: DetectionLabel::Ok,
            confidence,
            reasons: vec!["ordinary conversation".to_string()],
        }))
    }

    pub fn failing() -> Self {
        Self::with(StubBehavior::Fail)
    }

    pub fn hanging() -> Self {
        Self::with(StubBehavior::Hang)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SuspicionClassifier for StubClassifier {
    async fn analyze(&self, _input: &ClassifierInput) -> Result<ClassifierVerdict, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            StubBehavior::Verdict(v) => Ok(v.clone()),
            StubBehavior::Fail => Err(ClassifierError::Request("HTTP 503".to_string())),
            StubBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(ClassifierError::Request("unreachable".to_string()))
            }
        }
    }
}

/// Every platform call the pipeline made, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformCall {
    SendNotification { channel_id: u64, case_id: u64 },
    EditNotification { message: MessageRef, case_id: u64 },
    AddRole { user_id: u64, role_id: u64 },
    RemoveRole { user_id: u64, role_id: u64 },
    Ban { user_id: u64, reason: String },
    CreateThread { message: MessageRef },
    PostToThread { thread_id: u64 },
    ArchiveThread { thread_id: u64, archived: bool },
}

/// Platform double that records calls and can be told to fail.
pub struct RecordingPlatform {
    calls: Mutex<Vec<PlatformCall>>,
    next_id: AtomicU64,
    pub member_missing: AtomicBool,
    pub fail_notifications: AtomicBool,
    pub fail_bans: AtomicBool,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(9_000),
            member_missing: AtomicBool::new(false),
            fail_notifications: AtomicBool::new(false),
            fail_bans: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&PlatformCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ModerationPlatform for RecordingPlatform {
    async fn fetch_member(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<MemberProfile>, PlatformError> {
        if self.member_missing.load(Ordering::SeqCst) {
            return Err(PlatformError::MemberNotFound { guild_id, user_id });
        }
        Ok(Some(profile(user_id, 30)))
    }

    async fn send_notification(
        &self,
        channel_id: u64,
        notification: &CaseNotification,
    ) -> Result<MessageRef, PlatformError> {
        if self.fail_notifications.load(Ordering::SeqCst) {
            return Err(PlatformError::Api("500 Internal Server Error".to_string()));
        }
        self.record(PlatformCall::SendNotification {
            channel_id,
            case_id: notification.case_id,
        });
        Ok(MessageRef {
            channel_id,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn edit_notification(
        &self,
        message: MessageRef,
        notification: &CaseNotification,
    ) -> Result<(), PlatformError> {
        self.record(PlatformCall::EditNotification {
            message,
            case_id: notification.case_id,
        });
        Ok(())
    }

    async fn add_role(
        &self,
        _guild_id: u64,
        user_id: u64,
        role_id: u64,
        _reason: &str,
    ) -> Result<(), PlatformError> {
        self.record(PlatformCall::AddRole { user_id, role_id });
        Ok(())
    }

    async fn remove_role(
        &self,
        _guild_id: u64,
        user_id: u64,
        role_id: u64,
        _reason: &str,
    ) -> Result<(), PlatformError> {
        self.record(PlatformCall::RemoveRole { user_id, role_id });
        Ok(())
    }

    async fn ban_member(
        &self,
        _guild_id: u64,
        user_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError> {
        if self.fail_bans.load(Ordering::SeqCst) {
            return Err(PlatformError::Api("403 Missing Permissions".to_string()));
        }
        self.record(PlatformCall::Ban {
            user_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn create_thread(&self, message: MessageRef, _name: &str) -> Result<u64, PlatformError> {
        self.record(PlatformCall::CreateThread { message });
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn post_to_thread(&self, thread_id: u64, _content: &str) -> Result<(), PlatformError> {
        self.record(PlatformCall::PostToThread { thread_id });
        Ok(())
    }

    async fn set_thread_archived(
        &self,
        thread_id: u64,
        archived: bool,
    ) -> Result<(), PlatformError> {
        self.record(PlatformCall::ArchiveThread {
            thread_id,
            archived,
        });
        Ok(())
    }
}

/// The whole pipeline wired over in-memory stores and a recording platform.
pub struct Harness {
    pub store: Arc<InMemorySecurityStore>,
    pub platform: Arc<RecordingPlatform>,
    pub service: Arc<SecurityActionService>,
    pub actuator: ModerationActuator,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(InMemorySecurityStore::new());
        let platform = Arc::new(RecordingPlatform::new());
        let bus = Arc::new(EventBus::new());
        let locks = Arc::new(ActorLocks::new());

        store
            .save_config(
                GUILD_ID,
                SecurityConfig {
                    restricted_role_id: Some(RESTRICTED_ROLE_ID),
                    alert_channel_id: Some(ALERT_CHANNEL_ID),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        register_subscribers(
            &bus,
            SubscriberDeps {
                config: store.clone(),
                cases: store.clone(),
                admin_actions: store.clone(),
                members: store.clone(),
                platform: platform.clone(),
            },
        );

        let service = Arc::new(SecurityActionService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::clone(&bus),
            Arc::clone(&locks),
        ));
        let actuator = ModerationActuator::new(
            store.clone(),
            store.clone(),
            platform.clone(),
            bus,
            locks,
        );

        Self {
            store,
            platform,
            service,
            actuator,
        }
    }

    pub async fn config(&self) -> SecurityConfig {
        self.store.get_config(GUILD_ID).await.unwrap()
    }

    pub fn detection(&self) -> DetectionResult {
        DetectionResult {
            label: DetectionLabel::Suspicious,
            confidence: 0.85,
            reasons: vec!["Matched keyword \"airdrop\"".to_string()],
            trigger_source: SignalType::Message,
            trigger_content: Some("claim the airdrop".to_string()),
            detection_event_id: None,
            source: None,
        }
    }

    /// Run a suspicious verdict through the action service.
    pub async fn open_case(&self, user_id: u64) -> VerificationCase {
        self.service
            .handle_suspicion(GUILD_ID, user_id, self.detection(), None)
            .await
            .unwrap()
            .case()
            .cloned()
            .unwrap()
    }
}
