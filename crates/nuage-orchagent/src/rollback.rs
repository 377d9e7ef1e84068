//! Compensating actions for multi-step VSD changes.
//!
//! Every manager records one [`CompensatingAction`] per completed remote
//! step on a [`Ledger`]. On failure the ledger is unwound newest first by a
//! [`VsdCompensator`], and [`rollback`] folds any unwind failures into the
//! error that triggered it.

use crate::error::{OrchError, OrchResult};
use crate::store::NetworkCatalog;
use async_trait::async_trait;
use nuage_orch_common::{Compensator, RollbackLedger};
use nuage_vsd::{RemoteControllerClient, Resource};
use serde_json::json;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensatingAction {
    /// Deletes an object the operation created on the VSD.
    DeleteRemote { resource: Resource, id: String },
    /// Revokes a group permission granted on a VSD subnet.
    DetachGroup { permission_id: String },
    /// Deletes a local port reserved for the VSD DHCP address.
    DeleteLocalPort { port_id: String },
    /// Restores the policy groups of a vport.
    SetVportPolicyGroups {
        vport_id: String,
        policy_group_ids: Vec<String>,
    },
}

impl CompensatingAction {
    pub fn delete_remote(resource: Resource, id: impl Into<String>) -> Self {
        CompensatingAction::DeleteRemote {
            resource,
            id: id.into(),
        }
    }
}

pub type Ledger = RollbackLedger<CompensatingAction>;

/// Executes compensating actions against the VSD and the local catalog.
pub struct VsdCompensator<'a, C: ?Sized> {
    client: &'a C,
    catalog: Option<&'a dyn NetworkCatalog>,
}

impl<'a, C> VsdCompensator<'a, C>
where
    C: RemoteControllerClient + ?Sized,
{
    /// A compensator for remote-only ledgers.
    pub fn remote(client: &'a C) -> Self {
        Self { client, catalog: None }
    }

    pub fn with_catalog(client: &'a C, catalog: &'a dyn NetworkCatalog) -> Self {
        Self {
            client,
            catalog: Some(catalog),
        }
    }
}

#[async_trait]
impl<'a, C> Compensator<CompensatingAction> for VsdCompensator<'a, C>
where
    C: RemoteControllerClient + ?Sized,
{
    type Error = OrchError;

    async fn compensate(&self, action: &CompensatingAction) -> OrchResult<()> {
        match action {
            CompensatingAction::DeleteRemote { resource, id } => {
                self.client.delete(&resource.object_path(id)).await?;
            }
            CompensatingAction::DetachGroup { permission_id } => {
                self.client
                    .delete(&Resource::Permission.object_path(permission_id))
                    .await?;
            }
            CompensatingAction::DeleteLocalPort { port_id } => {
                let catalog = self.catalog.ok_or_else(|| {
                    OrchError::Internal(format!("no catalog to delete local port {}", port_id))
                })?;
                catalog.delete_port(port_id)?;
            }
            CompensatingAction::SetVportPolicyGroups {
                vport_id,
                policy_group_ids,
            } => {
                self.client
                    .put(
                        &Resource::Vport.child_path(vport_id, Resource::PolicyGroup),
                        json!(policy_group_ids),
                    )
                    .await?;
            }
        }
        debug!(?action, "compensated");
        Ok(())
    }
}

/// Unwinds `ledger` and returns `error`, annotated with any failed steps.
pub async fn rollback<C>(ledger: &mut Ledger, compensator: &C, error: OrchError) -> OrchError
where
    C: Compensator<CompensatingAction, Error = OrchError> + ?Sized,
{
    let failures = ledger.unwind(compensator).await;
    OrchError::with_rollback(error, failures)
}
