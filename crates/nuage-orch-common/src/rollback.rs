//! Rollback ledger for multi-step remote operations.
//!
//! An operation that creates several remote objects records one compensating
//! action per completed step. When a later step fails, the ledger is unwound
//! in reverse order through a [`Compensator`]. Unwinding never replaces the
//! error that triggered it: compensation failures are logged and returned to
//! the caller separately.

use async_trait::async_trait;
use std::fmt;
use tracing::{debug, warn};

/// Executes the compensating actions recorded in a [`RollbackLedger`].
#[async_trait]
pub trait Compensator<A: Sync>: Send + Sync {
    type Error: fmt::Display + Send;

    async fn compensate(&self, action: &A) -> Result<(), Self::Error>;
}

/// A compensating action that could not be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackFailure<A, E> {
    pub action: A,
    pub error: E,
}

/// Ordered record of compensating actions for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackLedger<A> {
    actions: Vec<A>,
}

impl<A> Default for RollbackLedger<A> {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
        }
    }
}

impl<A> RollbackLedger<A>
where
    A: fmt::Debug + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the compensating action for a step that just succeeded.
    pub fn record(&mut self, action: A) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Recorded actions, oldest first.
    pub fn actions(&self) -> &[A] {
        &self.actions
    }

    /// Discards the recorded actions once the operation has succeeded.
    pub fn commit(&mut self) {
        self.actions.clear();
    }

    /// Executes every recorded action, newest first, and empties the ledger.
    ///
    /// A failing action does not stop the unwind.
    pub async fn unwind<C>(&mut self, compensator: &C) -> Vec<RollbackFailure<A, C::Error>>
    where
        C: Compensator<A> + ?Sized,
    {
        let mut failures = Vec::new();
        while let Some(action) = self.actions.pop() {
            debug!(?action, "rolling back");
            if let Err(error) = compensator.compensate(&action).await {
                warn!(?action, %error, "rollback step failed");
                failures.push(RollbackFailure { action, error });
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Undo {
        Delete(&'static str),
    }

    struct Recorder {
        executed: Arc<Mutex<Vec<Undo>>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Compensator<Undo> for Recorder {
        type Error = String;

        async fn compensate(&self, action: &Undo) -> Result<(), String> {
            let Undo::Delete(id) = action;
            if self.fail_on == Some(*id) {
                return Err(format!("cannot delete {}", id));
            }
            self.executed.lock().unwrap().push(action.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_order() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder {
            executed: executed.clone(),
            fail_on: None,
        };
        let mut ledger = RollbackLedger::new();
        ledger.record(Undo::Delete("pg"));
        ledger.record(Undo::Delete("rule-1"));
        ledger.record(Undo::Delete("rule-2"));

        let failures = ledger.unwind(&recorder).await;

        assert!(failures.is_empty());
        assert!(ledger.is_empty());
        assert_eq!(
            *executed.lock().unwrap(),
            vec![
                Undo::Delete("rule-2"),
                Undo::Delete("rule-1"),
                Undo::Delete("pg")
            ]
        );
    }

    #[tokio::test]
    async fn test_unwind_continues_past_failures() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder {
            executed: executed.clone(),
            fail_on: Some("rule-1"),
        };
        let mut ledger = RollbackLedger::new();
        ledger.record(Undo::Delete("pg"));
        ledger.record(Undo::Delete("rule-1"));

        let failures = ledger.unwind(&recorder).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].action, Undo::Delete("rule-1"));
        assert_eq!(failures[0].error, "cannot delete rule-1");
        assert_eq!(*executed.lock().unwrap(), vec![Undo::Delete("pg")]);
    }

    #[tokio::test]
    async fn test_commit_discards_actions() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder {
            executed: executed.clone(),
            fail_on: None,
        };
        let mut ledger = RollbackLedger::new();
        ledger.record(Undo::Delete("pg"));
        ledger.commit();

        assert!(ledger.unwind(&recorder).await.is_empty());
        assert!(executed.lock().unwrap().is_empty());
    }
}
