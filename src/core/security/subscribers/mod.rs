// Reaction subscribers - one side effect each.
//
// Registration order matters only for readability of logs: handlers for one
// event run one after another in this order, but none of them relies on
// another having finished.

pub mod audit_log;
pub mod member_status;
pub mod notification;
pub mod reopen;
pub mod restriction;
pub mod role_update;

pub use audit_log::AuditLogSubscriber;
pub use member_status::MemberStatusSubscriber;
pub use notification::NotificationSubscriber;
pub use reopen::ReopenSubscriber;
pub use restriction::RestrictionSubscriber;
pub use role_update::RoleUpdateSubscriber;

use super::event_bus::{EventBus, SubscriptionId};
use super::platform::ModerationPlatform;
use super::security_store::{AdminActionStore, CaseStore, MemberStore, SecurityConfigStore};
use std::sync::Arc;

/// Collaborators the subscribers need.
#[derive(Clone)]
pub struct SubscriberDeps {
    pub config: Arc<dyn SecurityConfigStore>,
    pub cases: Arc<dyn CaseStore>,
    pub admin_actions: Arc<dyn AdminActionStore>,
    pub members: Arc<dyn MemberStore>,
    pub platform: Arc<dyn ModerationPlatform>,
}

/// Wire every subscriber onto the bus.
pub fn register_subscribers(bus: &EventBus, deps: SubscriberDeps) -> Vec<SubscriptionId> {
    let mut ids = Vec::new();

    ids.extend(bus.register(Arc::new(RestrictionSubscriber::new(
        Arc::clone(&deps.config),
        Arc::clone(&deps.platform),
    ))));
    ids.extend(bus.register(Arc::new(NotificationSubscriber::new(
        Arc::clone(&deps.config),
        Arc::clone(&deps.cases),
        Arc::clone(&deps.platform),
    ))));
    ids.extend(bus.register(Arc::new(RoleUpdateSubscriber::new(
        Arc::clone(&deps.config),
        Arc::clone(&deps.platform),
    ))));
    // Reopen before audit so the thread is unarchived when the audit note lands.
    ids.extend(bus.register(Arc::new(ReopenSubscriber::new(
        Arc::clone(&deps.config),
        Arc::clone(&deps.cases),
        Arc::clone(&deps.platform),
    ))));
    ids.extend(bus.register(Arc::new(AuditLogSubscriber::new(
        Arc::clone(&deps.admin_actions),
        Arc::clone(&deps.cases),
        Arc::clone(&deps.platform),
    ))));
    ids.extend(bus.register(Arc::new(MemberStatusSubscriber::new(
        deps.config,
        deps.members,
    ))));

    tracing::debug!(subscriptions = ids.len(), "Security subscribers registered");
    ids
}
