//! PortLifecycle implementation.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::types::{Port, DEVICE_OWNER_DHCP_NUAGE, VNIC_NORMAL};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::error::{OrchError, OrchResult};
use crate::notify::{EventPhase, LifecycleEvent, Notifier};
use crate::policy::{PolicyGroupKind, PolicyGroupManager};
use crate::rollback::{rollback, CompensatingAction, Ledger, VsdCompensator};
use crate::store::{LocalMappingStore, NetworkCatalog, SubnetMapping, VsdSubnetKind};
use crate::vsd::{self, ParentDomain};
use nuage_types::IpVersion;
use nuage_vsd::{NuageFilter, RemoteControllerClient, Resource, VsdErrorCode, VsdObject};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

const VPORT_TYPE_VM: &str = "VM";
const VPORT_TYPE_HOST: &str = "HOST";
const SPOOFING_ENABLED: &str = "ENABLED";
const SPOOFING_INHERITED: &str = "INHERITED";

/// Configuration for PortLifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLifecycleConfig {
    /// Suffix of every external id.
    pub cms_id: String,
}

impl Default for PortLifecycleConfig {
    fn default() -> Self {
        Self {
            cms_id: "openstack".to_string(),
        }
    }
}

/// Statistics for PortLifecycle.
#[derive(Debug, Clone, Default)]
pub struct PortLifecycleStats {
    pub vports_created: u64,
    pub vports_deleted: u64,
    pub vms_created: u64,
    pub vms_deleted: u64,
    pub interfaces_updated: u64,
    pub rollbacks: u64,
}

fn address_spoofing(port: &Port) -> &'static str {
    if port.port_security_enabled {
        SPOOFING_INHERITED
    } else {
        SPOOFING_ENABLED
    }
}

fn wants_vm(port: &Port) -> bool {
    port.is_host_bound() && port.should_have_vm()
}

fn ip_list(port: &Port) -> String {
    port.fixed_ips
        .iter()
        .map(|ip| ip.ip_address.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Keeps vports and VMs in step with local ports.
pub struct PortLifecycle {
    config: PortLifecycleConfig,
    client: Arc<dyn RemoteControllerClient>,
    store: Arc<dyn LocalMappingStore>,
    catalog: Arc<dyn NetworkCatalog>,
    policy_groups: PolicyGroupManager,
    notifier: Notifier,
    stats: PortLifecycleStats,
}

impl std::fmt::Debug for PortLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLifecycle")
            .field("config", &self.config)
            .field("hooks", &self.notifier.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl PortLifecycle {
    pub fn new(
        config: PortLifecycleConfig,
        client: Arc<dyn RemoteControllerClient>,
        store: Arc<dyn LocalMappingStore>,
        catalog: Arc<dyn NetworkCatalog>,
        policy_groups: PolicyGroupManager,
    ) -> Self {
        Self {
            config,
            client,
            store,
            catalog,
            policy_groups,
            notifier: Notifier::new(),
            stats: PortLifecycleStats::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &PortLifecycleConfig {
        &self.config
    }

    pub fn stats(&self) -> &PortLifecycleStats {
        &self.stats
    }

    pub fn policy_groups(&self) -> &PolicyGroupManager {
        &self.policy_groups
    }

    fn compensator(&self) -> VsdCompensator<'_, dyn RemoteControllerClient> {
        VsdCompensator::with_catalog(&*self.client, &*self.catalog)
    }

    fn external_id(&self, id: &str) -> String {
        vsd::external_id(id, &self.config.cms_id)
    }

    /// Decides whether a port gets a vport and on which VSD subnet.
    ///
    /// Returns `None` for ports the VSD does not represent: no fixed IPs,
    /// owners without vports, unsupported vnic types and ports on unmapped
    /// subnets.
    pub fn validate(&self, port: &Port) -> OrchResult<Option<SubnetMapping>> {
        if port.fixed_ips.is_empty() {
            return Ok(None);
        }
        let (v4, v6) = port.fixed_ips_per_version();
        if port.is_dhcp() && v4 == 0 && v6 == 1 {
            return Ok(None);
        }
        if !port.needs_vport() {
            return Ok(None);
        }
        let external = self
            .catalog
            .network(&port.network_id)?
            .is_some_and(|n| n.external);
        if port.is_dhcp() && external {
            return Ok(None);
        }
        if v4 == 0 {
            return Err(OrchError::validation("Port can't be a pure ipv6 port. Need ipv4 fixed ip."));
        }
        if external {
            return Err(OrchError::validation("Cannot create port in a FIP pool Subnet"));
        }
        if port.binding.vnic_type != VNIC_NORMAL || port.device_owner == DEVICE_OWNER_DHCP_NUAGE {
            return Ok(None);
        }

        let mappings = self.mappings_of(port)?;
        let nuage_subnets: BTreeSet<&str> = mappings.iter().map(|m| m.nuage_subnet_id.as_str()).collect();
        if nuage_subnets.len() > 1 && mappings.iter().all(|m| m.vsd_managed) {
            return Err(OrchError::validation("Port has fixed ips for multiple vsd subnets."));
        }
        Ok(mappings.into_iter().next())
    }

    fn mappings_of(&self, port: &Port) -> OrchResult<Vec<SubnetMapping>> {
        let subnets: BTreeSet<&str> = port.fixed_ips.iter().map(|ip| ip.subnet_id.as_str()).collect();
        let mut mappings = Vec::new();
        for subnet_id in subnets {
            if let Some(mapping) = self.store.subnet_mapping(subnet_id)? {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    /// Creates the vport of a port and, for host-bound VM ports, the VM.
    /// Returns the vport id.
    #[instrument(skip(self, port), fields(port = %port.id, device = %port.device_id))]
    pub async fn create(&mut self, port: &Port) -> OrchResult<Option<String>> {
        let Some(mapping) = self.validate(port)? else {
            warn!("port is not on a VSD subnet, nothing to do");
            return Ok(None);
        };

        let mut ledger = Ledger::new();
        match self.create_remote(port, &mapping, &mut ledger).await {
            Ok((vport_id, vm_created)) => {
                ledger.commit();
                self.stats.vports_created += 1;
                if vm_created {
                    self.stats.vms_created += 1;
                }
                info!(vport = %vport_id, vm = vm_created, "port attached");
                audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "PortLifecycle", "create_vport")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(&vport_id)
                    .with_object_type("vport")
                    .with_details(json!({
                        "port": port.id,
                        "nuage_subnet": mapping.nuage_subnet_id,
                        "vm": vm_created,
                    })));
                Ok(Some(vport_id))
            }
            Err(e) => {
                let err = rollback(&mut ledger, &self.compensator(), e).await;
                self.stats.rollbacks += 1;
                audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "PortLifecycle", "create_vport")
                    .with_object_id(&port.id)
                    .with_object_type("port")
                    .with_error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn create_remote(
        &mut self,
        port: &Port,
        mapping: &SubnetMapping,
        ledger: &mut Ledger,
    ) -> OrchResult<(String, bool)> {
        let vport_id = self.create_vport(port, mapping, ledger).await?;
        let vm_created = wants_vm(port);
        if vm_created {
            self.create_vm(port, &vport_id, ledger).await?;
        }
        if !port.port_security_enabled && !mapping.vsd_managed {
            let parent = self.parent_of(mapping).await?;
            self.policy_groups
                .attach_allow_all(&vport_id, &parent, PolicyGroupKind::Software)
                .await?;
        }

        let event = LifecycleEvent::Port {
            phase: EventPhase::AfterCreate,
            port: port.clone(),
            original: None,
            vport_id: Some(vport_id.clone()),
            mapping: mapping.clone(),
        };
        self.notifier.notify(&event, ledger).await?;
        Ok((vport_id, vm_created))
    }

    async fn create_vport(&self, port: &Port, mapping: &SubnetMapping, ledger: &mut Ledger) -> OrchResult<String> {
        let parent = match mapping.kind {
            VsdSubnetKind::L2Domain => Resource::L2Domain,
            _ => Resource::Subnet,
        };
        let body = json!({
            "name": port.id,
            "description": port.name,
            "type": VPORT_TYPE_VM,
            "addressSpoofing": address_spoofing(port),
            "externalID": self.external_id(&port.id),
        });
        let vport = vsd::create_one(
            &*self.client,
            &parent.child_path(&mapping.nuage_subnet_id, Resource::Vport),
            body,
        )
        .await?;
        let vport_id = vport.require_id()?;
        ledger.record(CompensatingAction::delete_remote(Resource::Vport, &vport_id));
        debug!(vport = %vport_id, "vport created");
        Ok(vport_id)
    }

    /// Uuid of the VSD VM backing a port. LB and DHCP ports own theirs.
    fn vm_uuid<'p>(&self, port: &'p Port) -> &'p str {
        if port.owns_private_vm() {
            &port.id
        } else {
            &port.device_id
        }
    }

    async fn find_vm(&self, uuid: &str) -> OrchResult<Option<VsdObject>> {
        let filter = NuageFilter::eq("UUID", uuid);
        vsd::fetch(&*self.client, &Resource::Vm.collection_path(), Some(&filter)).await
    }

    async fn find_by_external_id(&self, kind: Resource, id: &str) -> OrchResult<Option<VsdObject>> {
        let filter = NuageFilter::eq("externalID", self.external_id(id));
        vsd::fetch(&*self.client, &kind.collection_path(), Some(&filter)).await
    }

    /// Creates the VM of a port, or another interface on it when a port of
    /// the same device already created it.
    async fn create_vm(&self, port: &Port, vport_id: &str, ledger: &mut Ledger) -> OrchResult<()> {
        let uuid = self.vm_uuid(port);
        let interface = json!({
            "name": port.id,
            "MAC": port.mac_address.to_vsd_string(),
            "IPAddress": port.ip_of(IpVersion::V4).map(|ip| ip.to_string()),
            "IPv6Address": port.ip_of(IpVersion::V6).map(|ip| ip.to_string()),
            "VPortID": vport_id,
            "externalID": self.external_id(&port.id),
        });
        match self.find_vm(uuid).await? {
            Some(vm) => {
                let vm_id = vm.require_id()?;
                let created = vsd::create_one(
                    &*self.client,
                    &Resource::Vm.child_path(&vm_id, Resource::VmInterface),
                    interface,
                )
                .await?;
                ledger.record(CompensatingAction::delete_remote(Resource::VmInterface, created.require_id()?));
                debug!(vm = %vm_id, "interface added to existing VM");
            }
            None => {
                let body = json!({
                    "name": uuid,
                    "UUID": uuid,
                    "externalID": self.external_id(uuid),
                    "interfaces": [interface],
                });
                let vm = vsd::create_one(&*self.client, &Resource::Vm.collection_path(), body).await?;
                let vm_id = vm.require_id()?;
                ledger.record(CompensatingAction::delete_remote(Resource::Vm, &vm_id));
                debug!(vm = %vm_id, "VM created");
            }
        }
        Ok(())
    }

    /// Ports of the same device that share the VM, this one included.
    fn vm_port_count(&self, port: &Port) -> OrchResult<usize> {
        if port.owns_private_vm() {
            return Ok(1);
        }
        let others = self
            .catalog
            .ports_of_device(&port.device_id)?
            .iter()
            .filter(|p| p.id != port.id && p.is_host_bound() && p.binding.vnic_type == VNIC_NORMAL)
            .count();
        Ok(others + 1)
    }

    /// Removes the port's interface, or the whole VM for its last port.
    async fn delete_vm(&mut self, port: &Port) -> OrchResult<()> {
        if self.vm_port_count(port)? > 1 {
            if let Some(interface) = self.find_by_external_id(Resource::VmInterface, &port.id).await? {
                self.client
                    .delete(&Resource::VmInterface.object_path(&interface.require_id()?))
                    .await?;
                debug!("VM interface removed, VM still in use");
            }
            return Ok(());
        }
        let Some(vm) = self.find_vm(self.vm_uuid(port)).await? else {
            debug!("no VM to delete");
            return Ok(());
        };
        let vm_id = vm.require_id()?;
        self.client.delete(&Resource::Vm.object_path(&vm_id)).await?;
        self.stats.vms_deleted += 1;
        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "PortLifecycle", "delete_vm")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&vm_id)
            .with_object_type("vm")
            .with_details(json!({ "port": port.id })));
        Ok(())
    }

    async fn parent_of(&self, mapping: &SubnetMapping) -> OrchResult<ParentDomain> {
        match mapping.kind {
            VsdSubnetKind::L2Domain => Ok(ParentDomain::l2domain(&mapping.nuage_subnet_id)),
            _ => vsd::domain_of_subnet(&*self.client, &mapping.nuage_subnet_id).await,
        }
    }

    /// Applies a port change to its vport and VM.
    #[instrument(skip(self, original, updated), fields(port = %updated.id))]
    pub async fn update(&mut self, original: &Port, updated: &Port) -> OrchResult<()> {
        let (o4, o6) = original.fixed_ips_per_version();
        let (u4, u6) = updated.fixed_ips_per_version();
        let dhcp = updated.is_dhcp();
        let lost_ipv4 = dhcp && (o4, o6) == (1, 1) && (u4, u6) == (0, 1);
        let gained_ipv4 = dhcp && (o4, o6) == (0, 1) && (u4, u6) == (1, 1);
        if (!original.fixed_ips.is_empty() && updated.fixed_ips.is_empty()) || lost_ipv4 {
            debug!("port lost its addresses, deleting");
            return self.delete(original).await;
        }
        if (original.fixed_ips.is_empty() && !updated.fixed_ips.is_empty()) || gained_ipv4 {
            debug!("port got addresses, creating");
            return self.create(updated).await.map(|_| ());
        }

        let Some(mapping) = self.validate(updated)? else {
            return Ok(());
        };
        let ips_changed = original.fixed_ips != updated.fixed_ips;
        if ips_changed {
            self.check_ip_update_allowed(original, updated)?;
        }
        let Some(vport) = self.find_by_external_id(Resource::Vport, &updated.id).await? else {
            return Err(OrchError::not_found("vport", &updated.id));
        };
        let vport_id = vport.require_id()?;

        let mut ledger = Ledger::new();
        match self
            .update_remote(original, updated, &mapping, &vport_id, ips_changed, &mut ledger)
            .await
        {
            Ok(()) => {
                ledger.commit();
                audit_log!(AuditRecord::new(AuditCategory::ResourceModify, "PortLifecycle", "update_vport")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(&vport_id)
                    .with_object_type("vport")
                    .with_details(json!({ "port": updated.id })));
                Ok(())
            }
            Err(e) => {
                let err = rollback(&mut ledger, &self.compensator(), e).await;
                self.stats.rollbacks += 1;
                Err(err)
            }
        }
    }

    async fn update_remote(
        &mut self,
        original: &Port,
        updated: &Port,
        mapping: &SubnetMapping,
        vport_id: &str,
        ips_changed: bool,
        ledger: &mut Ledger,
    ) -> OrchResult<()> {
        if ips_changed || original.mac_address != updated.mac_address {
            self.update_vm_interface(updated).await?;
        }

        match (wants_vm(original), wants_vm(updated)) {
            (false, true) => {
                self.create_vm(updated, vport_id, ledger).await?;
                self.stats.vms_created += 1;
            }
            (true, false) => self.delete_vm(original).await?,
            _ => {}
        }

        let event = LifecycleEvent::Port {
            phase: EventPhase::AfterUpdate,
            port: updated.clone(),
            original: Some(original.clone()),
            vport_id: Some(vport_id.to_string()),
            mapping: mapping.clone(),
        };
        self.notifier.notify(&event, ledger).await?;

        if original.port_security_enabled != updated.port_security_enabled
            && updated.security_groups.is_empty()
            && !mapping.vsd_managed
        {
            self.apply_port_security(updated, mapping, vport_id).await?;
        }
        Ok(())
    }

    async fn apply_port_security(&mut self, port: &Port, mapping: &SubnetMapping, vport_id: &str) -> OrchResult<()> {
        if port.port_security_enabled {
            self.policy_groups
                .detach_allow_all(vport_id, PolicyGroupKind::Software)
                .await?;
        } else {
            let parent = self.parent_of(mapping).await?;
            self.policy_groups
                .attach_allow_all(vport_id, &parent, PolicyGroupKind::Software)
                .await?;
        }
        self.client
            .put(
                &Resource::Vport.object_path(vport_id),
                json!({ "addressSpoofing": address_spoofing(port) }),
            )
            .await?;
        debug!(enabled = port.port_security_enabled, "port security rewired");
        Ok(())
    }

    fn check_ip_update_allowed(&self, original: &Port, updated: &Port) -> OrchResult<()> {
        if updated.is_dhcp() || updated.device_owner == DEVICE_OWNER_DHCP_NUAGE {
            return Ok(());
        }
        // Judged by the binding the port had before this update.
        if !original.is_unplugged() {
            return Err(OrchError::PortBound {
                port_id: original.id.clone(),
                vif_type: original.binding.vif_type.clone(),
                old_ips: ip_list(original),
                new_ips: ip_list(updated),
            });
        }
        let subnets: BTreeSet<&str> = updated.fixed_ips.iter().map(|ip| ip.subnet_id.as_str()).collect();
        if subnets.len() != updated.fixed_ips.len() {
            return Err(OrchError::validation(format!(
                "It is not allowed to add more than one ip per neutron subnet to port {}.",
                updated.id
            )));
        }

        let vsd_subnets = |port: &Port| -> OrchResult<BTreeSet<String>> {
            Ok(self
                .mappings_of(port)?
                .into_iter()
                .map(|m| m.nuage_subnet_id)
                .collect())
        };
        let after = vsd_subnets(updated)?;
        if after.len() > 1 {
            return Err(OrchError::validation(
                "One neutron port cannot correspond to multiple VSD subnets",
            ));
        }
        if vsd_subnets(original)? != after {
            return Err(OrchError::validation(format!(
                "Updating fixed ip of port {} to a different subnet is not allowed.",
                updated.id
            )));
        }
        Ok(())
    }

    async fn update_vm_interface(&mut self, port: &Port) -> OrchResult<()> {
        let Some(interface) = self.find_by_external_id(Resource::VmInterface, &port.id).await? else {
            debug!("port has no VM interface");
            return Ok(());
        };
        let body = json!({
            "MAC": port.mac_address.to_vsd_string(),
            "IPAddress": port.ip_of(IpVersion::V4).map(|ip| ip.to_string()),
            "IPv6Address": port.ip_of(IpVersion::V6).map(|ip| ip.to_string()),
        });
        let path = Resource::VmInterface.object_path(&interface.require_id()?);
        match self.client.put(&path, body).await {
            Ok(()) => {}
            Err(e) if e.has_code(&VsdErrorCode::VmAlreadyResync) => {
                debug!("VM interface already resynced");
            }
            Err(e) => return Err(e.into()),
        }
        self.stats.interfaces_updated += 1;
        Ok(())
    }

    /// Removes the VM and vport of a port.
    #[instrument(skip(self, port), fields(port = %port.id, device = %port.device_id))]
    pub async fn delete(&mut self, port: &Port) -> OrchResult<()> {
        let Some(mapping) = self.mappings_of(port)?.into_iter().next() else {
            return Ok(());
        };
        if !port.needs_vport() {
            return self.delete_host_vport(port).await;
        }
        if wants_vm(port) {
            self.delete_vm(port).await?;
        }

        let Some(vport) = self.find_by_external_id(Resource::Vport, &port.id).await? else {
            debug!("no vport to delete");
            return Ok(());
        };
        let vport_id = vport.require_id()?;
        match vport.str("type") {
            Some(VPORT_TYPE_VM) => {
                self.client.delete(&Resource::Vport.object_path(&vport_id)).await?;
                self.stats.vports_deleted += 1;
                info!(vport = %vport_id, "port detached");
                audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "PortLifecycle", "delete_vport")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(&vport_id)
                    .with_object_type("vport")
                    .with_details(json!({ "port": port.id })));
                let event = LifecycleEvent::Port {
                    phase: EventPhase::AfterDelete,
                    port: port.clone(),
                    original: None,
                    vport_id: Some(vport_id),
                    mapping,
                };
                self.notifier.dispatch(&event, &self.compensator()).await
            }
            Some(VPORT_TYPE_HOST) => {
                self.client.delete(&Resource::Vport.object_path(&vport_id)).await?;
                self.stats.vports_deleted += 1;
                Ok(())
            }
            other => {
                debug!(vport_type = ?other, "leaving vport in place");
                Ok(())
            }
        }
    }

    async fn delete_host_vport(&mut self, port: &Port) -> OrchResult<()> {
        let Some(vport) = self.find_by_external_id(Resource::Vport, &port.id).await? else {
            return Ok(());
        };
        if vport.str("type") != Some(VPORT_TYPE_HOST) {
            return Ok(());
        }
        let vport_id = vport.require_id()?;
        self.client.delete(&Resource::Vport.object_path(&vport_id)).await?;
        self.stats.vports_deleted += 1;
        debug!(vport = %vport_id, "host vport removed");
        Ok(())
    }
}
