//! Post-operation notification hooks.
//!
//! After a port or subnet change has been applied on the VSD, the lifecycles
//! notify registered hooks. A hook may add remote state of its own and record
//! compensating actions on the shared ledger; if any hook fails, the ledger
//! is unwound and the failure propagates.

use crate::error::{OrchError, OrchResult};
use crate::port::types::Port;
use crate::rollback::{rollback, CompensatingAction, Ledger};
use crate::store::SubnetMapping;
use crate::subnet::types::Subnet;
use async_trait::async_trait;
use nuage_orch_common::Compensator;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventPhase {
    AfterCreate,
    AfterUpdate,
    AfterDelete,
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPhase::AfterCreate => write!(f, "after_create"),
            EventPhase::AfterUpdate => write!(f, "after_update"),
            EventPhase::AfterDelete => write!(f, "after_delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Port {
        phase: EventPhase,
        port: Port,
        original: Option<Port>,
        vport_id: Option<String>,
        mapping: SubnetMapping,
    },
    Subnet {
        phase: EventPhase,
        subnet: Subnet,
        mapping: Option<SubnetMapping>,
    },
}

impl LifecycleEvent {
    pub fn phase(&self) -> EventPhase {
        match self {
            LifecycleEvent::Port { phase, .. } | LifecycleEvent::Subnet { phase, .. } => *phase,
        }
    }

    pub fn resource(&self) -> &'static str {
        match self {
            LifecycleEvent::Port { .. } => "port",
            LifecycleEvent::Subnet { .. } => "subnet",
        }
    }
}

#[async_trait]
pub trait NotificationHook: Send + Sync {
    async fn notify(&self, event: &LifecycleEvent, ledger: &mut Ledger) -> OrchResult<()>;
}

/// Fans an event out to every registered hook, in registration order.
#[derive(Clone, Default)]
pub struct Notifier {
    hooks: Vec<Arc<dyn NotificationHook>>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn NotificationHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Stops at the first failing hook.
    pub async fn notify(&self, event: &LifecycleEvent, ledger: &mut Ledger) -> OrchResult<()> {
        for hook in &self.hooks {
            hook.notify(event, ledger).await?;
        }
        debug!(resource = event.resource(), phase = %event.phase(), hooks = self.hooks.len(), "notified");
        Ok(())
    }

    /// Runs the hooks on a fresh ledger. If one fails, whatever the hooks
    /// recorded is unwound before the error is returned.
    pub async fn dispatch<C>(&self, event: &LifecycleEvent, compensator: &C) -> OrchResult<()>
    where
        C: Compensator<CompensatingAction, Error = OrchError> + ?Sized,
    {
        if self.hooks.is_empty() {
            return Ok(());
        }
        let mut ledger = Ledger::new();
        match self.notify(event, &mut ledger).await {
            Ok(()) => {
                ledger.commit();
                Ok(())
            }
            Err(e) => Err(rollback(&mut ledger, compensator, e).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::VsdCompensator;
    use nuage_orch_test::FakeVsd;
    use nuage_vsd::{IgnoreErrors, Resource, RestMethod};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<EventPhase>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationHook for Recording {
        async fn notify(&self, event: &LifecycleEvent, ledger: &mut Ledger) -> OrchResult<()> {
            self.seen.lock().unwrap().push(event.phase());
            ledger.record(CompensatingAction::delete_remote(Resource::RedirectionTarget, "rt-1"));
            if self.fail {
                return Err(OrchError::conflict("hook failed"));
            }
            Ok(())
        }
    }

    fn subnet_event() -> LifecycleEvent {
        LifecycleEvent::Subnet {
            phase: EventPhase::AfterCreate,
            subnet: Subnet::new("s-1", "n-1", "10.0.0.0/24".parse().unwrap(), None),
            mapping: None,
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_and_share_ledger() {
        let first = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        let second = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let mut notifier = Notifier::new();
        notifier.register(first.clone());
        notifier.register(second.clone());

        let mut ledger = Ledger::new();
        let result = notifier.notify(&subnet_event(), &mut ledger).await;

        assert!(result.is_err());
        assert_eq!(ledger.len(), 2);
        assert_eq!(*first.seen.lock().unwrap(), vec![EventPhase::AfterCreate]);
        assert_eq!(subnet_event().resource(), "subnet");
    }

    #[tokio::test]
    async fn test_empty_notifier() {
        let notifier = Notifier::new();
        let mut ledger = Ledger::new();
        assert!(notifier.is_empty());
        notifier.notify(&subnet_event(), &mut ledger).await.unwrap();
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_unwinds_hook_actions() {
        let failing = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let mut notifier = Notifier::new();
        notifier.register(failing);
        let client = IgnoreErrors::new(FakeVsd::new());

        let err = notifier
            .dispatch(&subnet_event(), &VsdCompensator::remote(&client))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchError::Conflict(_)));
        assert_eq!(
            client.inner().requests_matching(RestMethod::Delete, "/redirectiontargets/rt-1"),
            1
        );
    }
}
