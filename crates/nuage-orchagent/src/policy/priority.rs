//! Random ACL entry priorities with bounded collision retries.

use crate::config::PriorityConfig;
use crate::error::{OrchError, OrchResult};
use nuage_orch_common::{retry, RetryError, RetryPolicy};
use nuage_vsd::{RemoteControllerClient, RestError, RestResult, VsdErrorCode, VsdObject};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use tracing::debug;

/// Draws entry priorities uniformly from a configured range and redraws when
/// the VSD reports that the priority is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityAllocator {
    config: PriorityConfig,
}

impl PriorityAllocator {
    pub fn new(config: PriorityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PriorityConfig {
        &self.config
    }

    pub fn draw(&self) -> u32 {
        rand::thread_rng().gen_range(self.config.min..=self.config.max)
    }

    /// Runs `create` with a fresh priority until it stops colliding.
    ///
    /// Only a priority conflict is retried; every other error returns
    /// immediately. After the configured number of collisions the call fails
    /// with a conflict.
    pub async fn create_with_priority<T, F, Fut>(&self, mut create: F) -> OrchResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RestResult<T>>,
    {
        let policy = RetryPolicy::immediate(self.config.attempts);
        let outcome = retry(
            &policy,
            |e: &RestError| e.is_conflict_with(&VsdErrorCode::PriorityConflict),
            |attempt| {
                let priority = self.draw();
                debug!(attempt, priority, "posting ACL entry");
                create(priority)
            },
        )
        .await;
        match outcome {
            Ok(value) => Ok(value),
            Err(RetryError::Exhausted { attempts, .. }) => Err(OrchError::conflict(format!(
                "Failed to create aclentrytemplate after {} attempts due to priority conflict",
                attempts
            ))),
            Err(RetryError::Fatal(e)) => Err(e.into()),
        }
    }

    /// Posts `body` to `path` with a drawn `priority` attribute.
    pub async fn create_entry<C, B>(&self, client: &C, path: &str, body: &B) -> OrchResult<VsdObject>
    where
        C: RemoteControllerClient + ?Sized,
        B: Serialize + Sync,
    {
        self.create_with_priority(|priority| async move {
            let body = VsdObject::from_serialize(body)?
                .with("priority", priority)
                .into_value();
            client
                .post(path, body)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| RestError::transport(format!("VSD returned no object for POST {}", path)))
        })
        .await
    }
}
