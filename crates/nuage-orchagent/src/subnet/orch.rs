//! SubnetLifecycle implementation.

use std::sync::Arc;
use std::time::Duration;

use super::types::{Network, Subnet, DHCPV6_STATEFUL};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::error::{OrchError, OrchResult};
use crate::notify::{EventPhase, LifecycleEvent, Notifier};
use crate::port::types::{FixedIp, Port, DEVICE_OWNER_DHCP_NUAGE};
use crate::rollback::{rollback, CompensatingAction, Ledger, VsdCompensator};
use crate::store::{LocalMappingStore, NetPartition, NetworkCatalog, SubnetMapping, VsdSubnetKind};
use crate::vsd::{self, Creation};
use nuage_orch_common::{retry, RetryError, RetryPolicy};
use nuage_types::{IpAddress, IpPrefix, IpVersion, MacAddress};
use nuage_vsd::{NuageFilter, RemoteControllerClient, Resource, VsdErrorCode, VsdObject};
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

/// Shared network resource type backing router:external subnets.
const SHARED_RESOURCE_FLOATING: &str = "FLOATING";
const ACL_TEMPLATE_PRIORITY: u32 = 1;
/// OUI of generated port MACs.
const MAC_PREFIX: [u8; 3] = [0xfa, 0x16, 0x3e];

/// Configuration for SubnetLifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetLifecycleConfig {
    /// Suffix of every external id.
    pub cms_id: String,
    /// Net partition, by id or name, for subnets that do not name one.
    pub default_net_partition: Option<String>,
    /// Applied while the IPv4 half of a dual-stack pair is not visible yet.
    pub dualstack_retry: RetryPolicy,
}

impl Default for SubnetLifecycleConfig {
    fn default() -> Self {
        Self {
            cms_id: "openstack".to_string(),
            default_net_partition: None,
            dualstack_retry: RetryPolicy::new(26, Duration::from_millis(200)),
        }
    }
}

/// Statistics for SubnetLifecycle.
#[derive(Debug, Clone, Default)]
pub struct SubnetLifecycleStats {
    pub l2domains_created: u64,
    pub l2domains_deleted: u64,
    /// IPv6 subnets added to an existing L2 domain.
    pub dualstack_links: u64,
    pub vsd_subnets_linked: u64,
    pub shared_resources_created: u64,
    pub shared_resources_deleted: u64,
    pub updates: u64,
    pub rollbacks: u64,
}

/// A pre-existing VSD subnet a local subnet links to.
struct VsdSubnet {
    object: VsdObject,
    kind: VsdSubnetKind,
    shared: Option<VsdObject>,
}

impl VsdSubnet {
    fn resource(&self) -> Resource {
        match self.kind {
            VsdSubnetKind::L2Domain => Resource::L2Domain,
            _ => Resource::Subnet,
        }
    }

    /// Object carrying the addressing; the shared resource when attached.
    fn addressing(&self) -> &VsdObject {
        self.shared.as_ref().unwrap_or(&self.object)
    }
}

/// Tenant group permission on a VSD subnet.
struct GroupGrant {
    group_id: String,
    permission_id: String,
}

fn mapping_resource(mapping: &SubnetMapping) -> Resource {
    match mapping.kind {
        VsdSubnetKind::L2Domain => Resource::L2Domain,
        VsdSubnetKind::Subnet => Resource::Subnet,
        VsdSubnetKind::SharedResource => Resource::SharedNetworkResource,
    }
}

fn ipv6_cidr(prefix: &IpPrefix) -> String {
    format!("{}/{}", prefix.network(), prefix.prefix_len())
}

fn random_mac() -> MacAddress {
    let mut rng = rand::thread_rng();
    MacAddress::new([MAC_PREFIX[0], MAC_PREFIX[1], MAC_PREFIX[2], rng.gen(), rng.gen(), rng.gen()])
}

fn ip_string(ip: Option<IpAddress>) -> Option<String> {
    ip.map(|ip| ip.to_string())
}

fn dhcp_options(subnet: &Subnet) -> Value {
    json!({
        "dnsServers": subnet.dns_nameservers.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "hostRoutes": subnet
            .host_routes
            .iter()
            .map(|r| json!({ "destination": r.destination.to_string(), "nexthop": r.nexthop.to_string() }))
            .collect::<Vec<_>>(),
        "gateway": ip_string(subnet.gateway_ip),
    })
}

fn dhcp_options_changed(original: &Subnet, updated: &Subnet) -> bool {
    original.dns_nameservers != updated.dns_nameservers
        || original.host_routes != updated.host_routes
        || original.gateway_ip != updated.gateway_ip
}

/// Body shared by the L2 domain template and the L2 domain.
fn l2domain_body(ipv4: &Subnet, ipv6: Option<&Subnet>, dhcp_ip: Option<IpAddress>, cms_id: &str) -> VsdObject {
    let description = if ipv4.name.is_empty() { &ipv4.id } else { &ipv4.name };
    let mut body = VsdObject::new()
        .with("name", ipv4.id.clone())
        .with("description", description.clone())
        .with("address", ipv4.cidr.network().to_string())
        .with("netmask", ipv4.cidr.netmask().to_string())
        .with("gateway", ip_string(dhcp_ip))
        .with("DHCPManaged", ipv4.enable_dhcp)
        .with("IPType", "IPV4")
        .with("dhcpOptions", dhcp_options(ipv4))
        .with("externalID", vsd::external_id(&ipv4.id, cms_id));
    if let Some(ipv6) = ipv6 {
        body.set("IPType", "DUALSTACK");
        body.set("IPv6Address", ipv6_cidr(&ipv6.cidr));
        body.set("IPv6Gateway", ip_string(ipv6.gateway_ip));
        body.set("enableDHCPv6", ipv6.enable_dhcp);
    }
    body
}

fn validate_openstack_managed(subnet: &Subnet, network: &Network) -> OrchResult<()> {
    if let Some(gateway) = &subnet.gateway_ip {
        if !subnet.cidr.contains(gateway) {
            return Err(OrchError::validation("Gateway IP outside of the subnet CIDR"));
        }
    }
    if !network.external && subnet.underlay.is_some() {
        return Err(OrchError::validation("underlay attribute can not be set for internal subnets"));
    }
    Ok(())
}

fn validate_cidr(subnet: &Subnet, vsd_subnet: &VsdSubnet) -> OrchResult<()> {
    let source = vsd_subnet.addressing();
    let matches = if subnet.is_ipv4() {
        source.str("address") == Some(subnet.cidr.network().to_string().as_str())
            && source.str("netmask") == Some(subnet.cidr.netmask().to_string().as_str())
    } else {
        source.str("IPv6Address") == Some(ipv6_cidr(&subnet.cidr).as_str())
    };
    if matches {
        Ok(())
    } else {
        Err(OrchError::validation(format!(
            "OpenStack subnet cidr {} does not match the VSD subnet cidr",
            subnet.cidr
        )))
    }
}

/// Takes the gateway from the VSD subnet. An L2 domain publishes its router
/// as a DHCP option this agent does not read, so it yields none.
fn apply_vsd_gateway(subnet: &mut Subnet, vsd_subnet: &VsdSubnet) {
    let source = vsd_subnet.addressing();
    let l2 = vsd_subnet.kind == VsdSubnetKind::L2Domain;
    let gateway = if subnet.is_ipv6() && !l2 {
        source.str("IPv6Gateway")
    } else if subnet.is_ipv4() && subnet.enable_dhcp {
        if l2 {
            None
        } else {
            source.str("gateway")
        }
    } else {
        if !subnet.dns_nameservers.is_empty() {
            warn!(subnet = %subnet.id, "dns_nameservers are dropped for this subnet");
            subnet.dns_nameservers.clear();
        }
        None
    };
    subnet.gateway_ip = gateway.and_then(|g| g.parse().ok());
}

/// Address the VSD hands out as DHCP server, if the agent must reserve it.
fn dhcp_reservation(subnet: &Subnet, vsd_subnet: &VsdSubnet) -> Option<IpAddress> {
    if vsd_subnet.kind != VsdSubnetKind::L2Domain && vsd_subnet.shared.is_none() {
        return None;
    }
    let source = vsd_subnet.addressing();
    if source.bool("DHCPManaged") == Some(false) {
        return None;
    }
    let attribute = if subnet.is_ipv6() { "IPv6Gateway" } else { "gateway" };
    source.str(attribute).and_then(|ip| ip.parse().ok())
}

/// Keeps VSD subnets in step with local subnets.
///
/// Local subnets come from the [`NetworkCatalog`]; the VSD side of each one
/// is recorded as a [`SubnetMapping`] in the [`LocalMappingStore`].
pub struct SubnetLifecycle {
    config: SubnetLifecycleConfig,
    client: Arc<dyn RemoteControllerClient>,
    store: Arc<dyn LocalMappingStore>,
    catalog: Arc<dyn NetworkCatalog>,
    notifier: Notifier,
    stats: SubnetLifecycleStats,
}

impl std::fmt::Debug for SubnetLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetLifecycle")
            .field("config", &self.config)
            .field("hooks", &self.notifier.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SubnetLifecycle {
    pub fn new(
        config: SubnetLifecycleConfig,
        client: Arc<dyn RemoteControllerClient>,
        store: Arc<dyn LocalMappingStore>,
        catalog: Arc<dyn NetworkCatalog>,
    ) -> Self {
        Self {
            config,
            client,
            store,
            catalog,
            notifier: Notifier::new(),
            stats: SubnetLifecycleStats::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &SubnetLifecycleConfig {
        &self.config
    }

    pub fn stats(&self) -> &SubnetLifecycleStats {
        &self.stats
    }

    fn compensator(&self) -> VsdCompensator<'_, dyn RemoteControllerClient> {
        VsdCompensator::with_catalog(&*self.client, &*self.catalog)
    }

    fn require_network(&self, network_id: &str) -> OrchResult<Network> {
        self.catalog
            .network(network_id)?
            .ok_or_else(|| OrchError::not_found("network", network_id))
    }

    /// Checks a subnet before anything is written. Returns false when the
    /// network is not backed by the VSD and the subnet needs no work.
    pub fn validate_create(&self, subnet: &Subnet, network: &Network) -> OrchResult<bool> {
        if subnet.nuagenet.is_some() && subnet.net_partition.is_none() {
            return Err(OrchError::validation("Parameter net-partition required when passing nuagenet"));
        }
        for (attribute, mode) in [
            ("ipv6_ra_mode", &subnet.ipv6_ra_mode),
            ("ipv6_address_mode", &subnet.ipv6_address_mode),
        ] {
            if matches!(mode.as_deref(), Some(m) if m != DHCPV6_STATEFUL) {
                return Err(OrchError::validation(format!(
                    "Attribute {} must be '{}' or not set.",
                    attribute, DHCPV6_STATEFUL
                )));
            }
        }
        if !network.is_vxlan() {
            if subnet.nuagenet.is_some() || subnet.net_partition.is_some() {
                return Err(OrchError::validation(
                    "Network should have 'provider:network_type' vxlan or have such a segment",
                ));
            }
            return Ok(false);
        }

        let vsd_managed = subnet.requests_vsd_managed();
        if vsd_managed {
            self.validate_vsd_managed(subnet, network)?;
        } else {
            validate_openstack_managed(subnet, network)?;
        }

        let mixed = self
            .store
            .mappings_by_network(&subnet.network_id)?
            .iter()
            .any(|m| m.subnet_id != subnet.id && m.vsd_managed != vsd_managed);
        if mixed {
            return Err(OrchError::validation(
                "Can't mix openstack and vsd managed subnets under 1 network.",
            ));
        }

        let siblings = self.catalog.subnets_of_network(&subnet.network_id)?;
        let (v4, v6) = siblings
            .iter()
            .filter(|s| s.id != subnet.id)
            .chain(std::iter::once(subnet))
            .fold((0, 0), |(v4, v6), s| if s.is_ipv4() { (v4 + 1, v6) } else { (v4, v6 + 1) });
        if !((v4 <= 1 && v6 == 1) || v6 == 0) {
            return Err(OrchError::validation(
                "A network with an ipv6 subnet may only have maximum 1 ipv4 and 1 ipv6 subnet",
            ));
        }
        Ok(true)
    }

    fn validate_vsd_managed(&self, subnet: &Subnet, network: &Network) -> OrchResult<()> {
        let Some(nuagenet) = subnet.nuagenet.as_deref() else {
            return Ok(());
        };
        let linked_elsewhere = self
            .store
            .mappings_by_network(&subnet.network_id)?
            .iter()
            .any(|m| m.subnet_id != subnet.id && m.nuage_subnet_id != nuagenet);
        if linked_elsewhere {
            return Err(OrchError::validation(
                "The network already has a subnet linked to a different vsd subnet.",
            ));
        }
        if self
            .store
            .mapping_by_nuage_id_and_version(nuagenet, subnet.ip_version())?
            .is_some()
        {
            return Err(OrchError::validation(
                "Multiple OpenStack Subnets with the same ip version cannot be linked to the same Nuage Subnet",
            ));
        }
        if network.external {
            return Err(OrchError::validation(format!(
                "Invalid network {}: router:external must be False for VSD-managed subnets",
                network.id
            )));
        }
        Ok(())
    }

    /// Provisions the VSD side of a new subnet.
    ///
    /// The subnet is completed in place with what the VSD decided: net
    /// partition, VSD subnet id, and for linked subnets the gateway and
    /// allocation pools. Returns the mapping, or `None` when the subnet has
    /// no VSD subnet of its own (external networks, non-VXLAN networks, and
    /// an IPv6 subnet still waiting for its IPv4 sibling).
    #[instrument(skip(self, subnet), fields(subnet = %subnet.id, network = %subnet.network_id))]
    pub async fn create(&mut self, subnet: &mut Subnet) -> OrchResult<Option<SubnetMapping>> {
        let network = self.require_network(&subnet.network_id)?;
        if !self.validate_create(subnet, &network)? {
            debug!("network is not VSD backed");
            return Ok(None);
        }
        let mapping = if subnet.requests_vsd_managed() {
            Some(self.create_vsd_managed(subnet).await?)
        } else if network.external {
            self.create_shared_resource(subnet).await?;
            None
        } else {
            self.create_openstack_managed(subnet).await?
        };

        let event = LifecycleEvent::Subnet {
            phase: EventPhase::AfterCreate,
            subnet: subnet.clone(),
            mapping: mapping.clone(),
        };
        self.notifier.dispatch(&event, &self.compensator()).await?;
        Ok(mapping)
    }

    async fn create_shared_resource(&mut self, subnet: &mut Subnet) -> OrchResult<()> {
        if subnet.is_ipv6() {
            return Err(OrchError::validation(
                "Subnet with ip_version 6 is currently not supported for router:external networks.",
            ));
        }
        let others = self
            .catalog
            .subnets_of_network(&subnet.network_id)?
            .into_iter()
            .filter(|s| s.id != subnet.id)
            .count();
        if others > 0 {
            return Err(OrchError::validation(format!(
                "Only one subnet is allowed per external network {}",
                subnet.network_id
            )));
        }

        let underlay = subnet.underlay.unwrap_or(false);
        let body = json!({
            "name": subnet.id,
            "description": subnet.name,
            "type": SHARED_RESOURCE_FLOATING,
            "address": subnet.cidr.network().to_string(),
            "netmask": subnet.cidr.netmask().to_string(),
            "gateway": ip_string(subnet.gateway_ip),
            "underlay": underlay,
            "DHCPManaged": true,
            "externalID": vsd::external_id(&subnet.id, &self.config.cms_id),
        });
        let created =
            vsd::create_one(&*self.client, &Resource::SharedNetworkResource.collection_path(), body).await?;
        let id = created.require_id()?;
        subnet.underlay = Some(underlay);

        self.stats.shared_resources_created += 1;
        info!(shared_resource = %id, underlay, "created floating IP shared resource");
        audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "SubnetLifecycle", "create_shared_resource")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&id)
            .with_object_type("sharednetworkresource")
            .with_details(json!({ "subnet": subnet.id, "cidr": subnet.cidr.to_string() })));
        Ok(())
    }

    async fn find_shared_resource(&self, subnet_id: &str) -> OrchResult<Option<VsdObject>> {
        let filter = NuageFilter::eq("externalID", vsd::external_id(subnet_id, &self.config.cms_id));
        vsd::fetch(
            &*self.client,
            &Resource::SharedNetworkResource.collection_path(),
            Some(&filter),
        )
        .await
    }

    async fn create_vsd_managed(&mut self, subnet: &mut Subnet) -> OrchResult<SubnetMapping> {
        let (Some(partition_ref), Some(nuagenet)) = (subnet.net_partition.clone(), subnet.nuagenet.clone()) else {
            return Err(OrchError::validation("Parameter net-partition required when passing nuagenet"));
        };
        let partition = self.sync_net_partition(&partition_ref).await?;
        let vsd_subnet = self.fetch_vsd_subnet(&nuagenet).await?;
        if self.enterprise_of(&vsd_subnet, &nuagenet).await? != partition.id {
            return Err(OrchError::validation(
                "Provided Nuage subnet not in the provided Nuage net-partition",
            ));
        }
        validate_cidr(subnet, &vsd_subnet)?;

        let requested_gateway = subnet.gateway_ip;
        apply_vsd_gateway(subnet, &vsd_subnet);
        if subnet.gateway_ip != requested_gateway {
            warn!(gateway = ?subnet.gateway_ip, "gateway and allocation pools follow the VSD subnet");
            let gateway = subnet.gateway_ip;
            subnet.regenerate_pools(gateway);
        }

        let mut ledger = Ledger::new();
        match self
            .link_vsd_subnet(subnet, &partition, &nuagenet, &vsd_subnet, &mut ledger)
            .await
        {
            Ok(mapping) => {
                ledger.commit();
                subnet.vsd_managed = true;
                self.stats.vsd_subnets_linked += 1;
                info!(nuage_subnet = %nuagenet, kind = ?mapping.kind, "linked VSD-managed subnet");
                audit_log!(AuditRecord::new(AuditCategory::NetworkConfig, "SubnetLifecycle", "link_vsd_subnet")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(&nuagenet)
                    .with_object_type(vsd_subnet.resource().entity_name())
                    .with_details(json!({ "subnet": subnet.id, "net_partition": partition.id })));
                Ok(mapping)
            }
            Err(e) => {
                let err = rollback(&mut ledger, &self.compensator(), e).await;
                self.stats.rollbacks += 1;
                audit_log!(AuditRecord::new(AuditCategory::NetworkConfig, "SubnetLifecycle", "link_vsd_subnet")
                    .with_object_id(&nuagenet)
                    .with_object_type(vsd_subnet.resource().entity_name())
                    .with_error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn link_vsd_subnet(
        &self,
        subnet: &Subnet,
        partition: &NetPartition,
        nuagenet: &str,
        vsd_subnet: &VsdSubnet,
        ledger: &mut Ledger,
    ) -> OrchResult<SubnetMapping> {
        let grant = self
            .grant_tenant_group(&partition.id, vsd_subnet.resource(), nuagenet, &subnet.tenant_id, ledger)
            .await?;
        if let Some(dhcp_ip) = dhcp_reservation(subnet, vsd_subnet) {
            self.reserve_ip(subnet, dhcp_ip, ledger)?;
        }
        let mapping = SubnetMapping {
            subnet_id: subnet.id.clone(),
            network_id: subnet.network_id.clone(),
            nuage_subnet_id: nuagenet.to_string(),
            nuage_l2dom_tmplt_id: None,
            net_partition_id: partition.id.clone(),
            ip_version: subnet.ip_version(),
            vsd_managed: true,
            kind: vsd_subnet.kind,
            nuage_group_id: Some(grant.group_id),
            nuage_permission_id: Some(grant.permission_id),
            tenant_id: subnet.tenant_id.clone(),
        };
        self.store.add_mapping(mapping.clone())?;
        Ok(mapping)
    }

    /// Looks the enterprise up by name, then by id, and refreshes the local
    /// record of it.
    async fn sync_net_partition(&self, reference: &str) -> OrchResult<NetPartition> {
        let by_name = NuageFilter::eq("name", reference);
        let enterprise = match vsd::fetch(&*self.client, &Resource::Enterprise.collection_path(), Some(&by_name)).await? {
            Some(enterprise) => enterprise,
            None => vsd::fetch(&*self.client, &Resource::Enterprise.object_path(reference), None)
                .await?
                .ok_or_else(|| OrchError::not_found("net_partition", reference))?,
        };
        let partition = NetPartition {
            id: enterprise.require_id()?,
            name: enterprise.name().unwrap_or(reference).to_string(),
        };
        match self.store.net_partition_by_name(&partition.name)? {
            Some(local) if local.id == partition.id => {}
            Some(stale) => {
                debug!(stale = %stale.id, current = %partition.id, "replacing stale net partition");
                self.store.delete_net_partition(&stale.id)?;
                self.store.add_net_partition(partition.clone())?;
            }
            None => self.store.add_net_partition(partition.clone())?,
        }
        Ok(partition)
    }

    fn local_net_partition(&self, subnet: &Subnet) -> OrchResult<NetPartition> {
        let reference = subnet
            .net_partition
            .as_deref()
            .or(self.config.default_net_partition.as_deref());
        let found = match reference {
            Some(reference) => match self.store.net_partition(reference)? {
                Some(partition) => Some(partition),
                None => self.store.net_partition_by_name(reference)?,
            },
            None => None,
        };
        found.ok_or_else(|| {
            OrchError::validation(
                "Either net_partition is not provided with subnet OR default net_partition is not created at the start",
            )
        })
    }

    async fn fetch_vsd_subnet(&self, id: &str) -> OrchResult<VsdSubnet> {
        let (object, kind) = match vsd::fetch(&*self.client, &Resource::L2Domain.object_path(id), None).await? {
            Some(object) => (object, VsdSubnetKind::L2Domain),
            None => {
                let object = vsd::fetch(&*self.client, &Resource::Subnet.object_path(id), None)
                    .await?
                    .ok_or_else(|| OrchError::not_found("nuage subnet", id))?;
                (object, VsdSubnetKind::Subnet)
            }
        };
        let shared = match object.str("associatedSharedNetworkResourceID").map(str::to_string) {
            Some(shared_id) => {
                Some(vsd::fetch_required(&*self.client, Resource::SharedNetworkResource, &shared_id).await?)
            }
            None => None,
        };
        Ok(VsdSubnet { object, kind, shared })
    }

    async fn enterprise_of(&self, vsd_subnet: &VsdSubnet, id: &str) -> OrchResult<String> {
        let owner = match vsd_subnet.kind {
            VsdSubnetKind::L2Domain => vsd_subnet.object.parent_id().map(str::to_string),
            _ => {
                let parent = vsd::domain_of_subnet(&*self.client, id).await?;
                let domain = vsd::fetch_required(&*self.client, Resource::Domain, &parent.id).await?;
                domain.parent_id().map(str::to_string)
            }
        };
        owner.ok_or_else(|| OrchError::not_found("enterprise of subnet", id))
    }

    /// Grants the tenant's group use of a VSD subnet, creating the group when
    /// needed. Only the permission is recorded on the ledger; groups outlive
    /// the subnets they were created for.
    async fn grant_tenant_group(
        &self,
        enterprise_id: &str,
        resource: Resource,
        vsd_id: &str,
        tenant_id: &str,
        ledger: &mut Ledger,
    ) -> OrchResult<GroupGrant> {
        let groups = Resource::Enterprise.child_path(enterprise_id, Resource::Group);
        let by_name = NuageFilter::eq("name", tenant_id);
        let group = match vsd::fetch(&*self.client, &groups, Some(&by_name)).await? {
            Some(group) => group,
            None => {
                let body = json!({
                    "name": tenant_id,
                    "description": tenant_id,
                    "externalID": vsd::external_id(tenant_id, &self.config.cms_id),
                });
                vsd::create_one(&*self.client, &groups, body).await?
            }
        };
        let group_id = group.require_id()?;

        let permissions = resource.child_path(vsd_id, Resource::Permission);
        let body = json!({
            "permittedEntityID": group_id,
            "permittedAction": "USE",
            "externalID": vsd::external_id(tenant_id, &self.config.cms_id),
        });
        let permission = match vsd::post_classified(&*self.client, &permissions, body, &VsdErrorCode::PermissionExists)
            .await?
        {
            Creation::Created(permission) => {
                let id = permission.require_id()?;
                ledger.record(CompensatingAction::DetachGroup { permission_id: id.clone() });
                id
            }
            Creation::Found(permission) => permission.require_id()?,
            Creation::Conflict(e) => {
                let filter = NuageFilter::eq("permittedEntityID", &group_id);
                vsd::fetch(&*self.client, &permissions, Some(&filter))
                    .await?
                    .ok_or(OrchError::Remote(e))?
                    .require_id()?
            }
        };
        debug!(group = %group_id, permission = %permission, "tenant group granted");
        Ok(GroupGrant {
            group_id,
            permission_id: permission,
        })
    }

    /// Reserves `ip` with a DHCP port so nothing else is allocated it.
    fn reserve_ip(&self, subnet: &Subnet, ip: IpAddress, ledger: &mut Ledger) -> OrchResult<Port> {
        let mut port = Port::new(format!("{}-dhcp-{}", subnet.id, ip), subnet.network_id.clone(), random_mac());
        port.tenant_id = subnet.tenant_id.clone();
        port.device_owner = DEVICE_OWNER_DHCP_NUAGE.to_string();
        port.fixed_ips = vec![FixedIp {
            subnet_id: subnet.id.clone(),
            ip_address: ip,
        }];
        let port = self.catalog.create_port(port)?;
        ledger.record(CompensatingAction::DeleteLocalPort { port_id: port.id.clone() });
        debug!(port = %port.id, %ip, "reserved DHCP address");
        Ok(port)
    }

    fn delete_gateway_ports(&self, ports: &[Port]) -> OrchResult<()> {
        for port in ports {
            self.catalog.delete_port(&port.id)?;
            debug!(port = %port.id, "released DHCP address");
        }
        Ok(())
    }

    async fn create_openstack_managed(&mut self, subnet: &mut Subnet) -> OrchResult<Option<SubnetMapping>> {
        let partition = self.local_net_partition(subnet)?;
        let policy = self.config.dualstack_retry;
        let outcome = {
            let this: &Self = &*self;
            let request: &Subnet = &*subnet;
            let partition_ref = &partition;
            retry(
                &policy,
                |e: &OrchError| matches!(e, OrchError::DualstackSubnetNotFound(_)),
                move |attempt| {
                    debug!(attempt, "provisioning VSD subnet");
                    this.provision_attempt(request, partition_ref)
                },
            )
            .await
        };

        let mapping = match outcome {
            Ok(mapping) => mapping,
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(attempts, error = %last, "IPv4 half of the dual-stack pair never appeared");
                return Err(OrchError::Internal("Failed to create subnet on vsd".to_string()));
            }
            Err(RetryError::Fatal(e)) => {
                self.stats.rollbacks += 1;
                audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "SubnetLifecycle", "create_l2domain")
                    .with_object_id(&subnet.id)
                    .with_object_type("subnet")
                    .with_error(e.to_string()));
                return Err(e);
            }
        };

        let Some(mapping) = mapping else {
            debug!("IPv6 subnet waits for its IPv4 sibling");
            return Ok(None);
        };
        subnet.net_partition = Some(partition.id.clone());
        subnet.nuagenet = Some(mapping.nuage_subnet_id.clone());
        let action = if subnet.is_ipv4() {
            self.stats.l2domains_created += 1;
            "create_l2domain"
        } else {
            self.stats.dualstack_links += 1;
            "link_ipv6_subnet"
        };
        info!(l2domain = %mapping.nuage_subnet_id, ip_version = %mapping.ip_version, "VSD subnet ready");
        audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "SubnetLifecycle", action)
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&mapping.nuage_subnet_id)
            .with_object_type("l2domain")
            .with_details(json!({ "subnet": subnet.id, "cidr": subnet.cidr.to_string() })));
        Ok(Some(mapping))
    }

    /// One provisioning attempt, unwound on its own ledger when it fails.
    async fn provision_attempt(&self, subnet: &Subnet, partition: &NetPartition) -> OrchResult<Option<SubnetMapping>> {
        let sibling = self
            .catalog
            .subnets_of_network(&subnet.network_id)?
            .into_iter()
            .find(|s| s.id != subnet.id && s.ip_version() != subnet.ip_version());

        if subnet.is_ipv6() {
            return match sibling {
                Some(ipv4) => self.link_ipv6(subnet, &ipv4).await.map(Some),
                None => Ok(None),
            };
        }

        let mut ledger = Ledger::new();
        match self.provision_l2domain(subnet, sibling.as_ref(), partition, &mut ledger).await {
            Ok(mapping) => {
                ledger.commit();
                Ok(Some(mapping))
            }
            Err(e) => Err(rollback(&mut ledger, &self.compensator(), e).await),
        }
    }

    async fn link_ipv6(&self, subnet: &Subnet, ipv4: &Subnet) -> OrchResult<SubnetMapping> {
        let ipv4_mapping = self
            .store
            .subnet_mapping(&ipv4.id)?
            .ok_or_else(|| OrchError::DualstackSubnetNotFound("Subnet".to_string()))?;
        let body = json!({
            "IPType": "DUALSTACK",
            "IPv6Address": ipv6_cidr(&subnet.cidr),
            "IPv6Gateway": ip_string(subnet.gateway_ip),
            "enableDHCPv6": subnet.enable_dhcp,
        });
        self.client
            .put(
                &mapping_resource(&ipv4_mapping).object_path(&ipv4_mapping.nuage_subnet_id),
                body,
            )
            .await?;
        let mapping = SubnetMapping {
            subnet_id: subnet.id.clone(),
            ip_version: IpVersion::V6,
            tenant_id: subnet.tenant_id.clone(),
            ..ipv4_mapping
        };
        self.store.add_mapping(mapping.clone())?;
        Ok(mapping)
    }

    async fn provision_l2domain(
        &self,
        subnet: &Subnet,
        ipv6: Option<&Subnet>,
        partition: &NetPartition,
        ledger: &mut Ledger,
    ) -> OrchResult<SubnetMapping> {
        let cms_id = &self.config.cms_id;
        let dhcp_ip = if subnet.enable_dhcp {
            let ip = subnet.last_pool_address().ok_or_else(|| {
                OrchError::validation(format!("Subnet {} has no allocation pool for the DHCP address", subnet.id))
            })?;
            self.reserve_ip(subnet, ip, ledger)?;
            Some(ip)
        } else {
            None
        };

        let template = vsd::create_one(
            &*self.client,
            &Resource::Enterprise.child_path(&partition.id, Resource::L2DomainTemplate),
            l2domain_body(subnet, ipv6, dhcp_ip, cms_id).into_value(),
        )
        .await?;
        let template_id = template.require_id()?;
        ledger.record(CompensatingAction::delete_remote(Resource::L2DomainTemplate, &template_id));

        let body = l2domain_body(subnet, ipv6, dhcp_ip, cms_id).with("templateID", template_id.clone());
        let l2domain = vsd::create_one(
            &*self.client,
            &Resource::Enterprise.child_path(&partition.id, Resource::L2Domain),
            body.into_value(),
        )
        .await?;
        let l2domain_id = l2domain.require_id()?;
        ledger.record(CompensatingAction::delete_remote(Resource::L2Domain, &l2domain_id));

        self.create_policy_templates(subnet, &l2domain_id).await?;
        let grant = self
            .grant_tenant_group(&partition.id, Resource::L2Domain, &l2domain_id, &subnet.tenant_id, ledger)
            .await?;

        let mapping = SubnetMapping {
            subnet_id: subnet.id.clone(),
            network_id: subnet.network_id.clone(),
            nuage_subnet_id: l2domain_id,
            nuage_l2dom_tmplt_id: Some(template_id),
            net_partition_id: partition.id.clone(),
            ip_version: IpVersion::V4,
            vsd_managed: false,
            kind: VsdSubnetKind::L2Domain,
            nuage_group_id: Some(grant.group_id),
            nuage_permission_id: Some(grant.permission_id),
            tenant_id: subnet.tenant_id.clone(),
        };
        if let Some(ipv6) = ipv6 {
            if self.store.subnet_mapping(&ipv6.id)?.is_none() {
                self.store.add_mapping(SubnetMapping {
                    subnet_id: ipv6.id.clone(),
                    ip_version: IpVersion::V6,
                    tenant_id: ipv6.tenant_id.clone(),
                    ..mapping.clone()
                })?;
            }
        }
        self.store.add_mapping(mapping.clone())?;
        Ok(mapping)
    }

    /// Ingress and egress ACL templates plus the forwarding template of a
    /// new L2 domain. They go away with the domain.
    async fn create_policy_templates(&self, subnet: &Subnet, l2domain_id: &str) -> OrchResult<()> {
        let external_id = vsd::external_id(&subnet.id, &self.config.cms_id);
        for (kind, suffix) in [
            (Resource::IngressAclTemplate, "ingress"),
            (Resource::EgressAclTemplate, "egress"),
        ] {
            let body = json!({
                "name": format!("{}_{}", subnet.id, suffix),
                "active": true,
                "priority": ACL_TEMPLATE_PRIORITY,
                "defaultAllowIP": false,
                "defaultAllowNonIP": false,
                "externalID": external_id,
            });
            vsd::create_one(&*self.client, &Resource::L2Domain.child_path(l2domain_id, kind), body).await?;
        }
        let body = json!({
            "name": format!("{}_fwd", subnet.id),
            "active": true,
            "externalID": external_id,
        });
        vsd::create_one(
            &*self.client,
            &Resource::L2Domain.child_path(l2domain_id, Resource::IngressAdvFwdTemplate),
            body,
        )
        .await?;
        Ok(())
    }

    /// Pushes an attribute change of a subnet to its VSD subnet.
    #[instrument(skip(self, original, updated), fields(subnet = %updated.id))]
    pub async fn update(&mut self, original: &Subnet, updated: &mut Subnet) -> OrchResult<()> {
        let mapping = self.store.subnet_mapping(&updated.id)?;
        let external = self
            .catalog
            .network(&updated.network_id)?
            .is_some_and(|n| n.external);
        if mapping.as_ref().is_some_and(|m| m.vsd_managed) {
            return Err(OrchError::validation(format!(
                "Subnet {} is a VSD-managed subnet. Update is not supported.",
                updated.id
            )));
        }
        if external {
            return self.update_shared_resource(updated).await;
        }
        let Some(mapping) = mapping else {
            return Ok(());
        };
        if updated.underlay.is_some() {
            return Err(OrchError::validation("underlay attribute can not be set for internal subnets"));
        }

        let path = mapping_resource(&mapping).object_path(&mapping.nuage_subnet_id);
        let mut ledger = Ledger::new();
        let outcome = if updated.is_ipv6() {
            self.push_ipv6_update(original, updated, &path).await
        } else {
            self.push_ipv4_update(original, updated, &path, &mut ledger).await
        };
        match outcome {
            Ok(pushed) => {
                ledger.commit();
                if pushed {
                    self.stats.updates += 1;
                    audit_log!(AuditRecord::new(AuditCategory::ResourceModify, "SubnetLifecycle", "update_subnet")
                        .with_outcome(AuditOutcome::Success)
                        .with_object_id(&mapping.nuage_subnet_id)
                        .with_object_type(mapping_resource(&mapping).entity_name())
                        .with_details(json!({ "subnet": updated.id })));
                }
                Ok(())
            }
            Err(e) => {
                let err = rollback(&mut ledger, &self.compensator(), e).await;
                self.stats.rollbacks += 1;
                Err(err)
            }
        }
    }

    async fn push_ipv6_update(&self, original: &Subnet, updated: &Subnet, path: &str) -> OrchResult<bool> {
        if original.gateway_ip == updated.gateway_ip {
            return Ok(false);
        }
        self.client
            .put(path, json!({ "IPv6Gateway": ip_string(updated.gateway_ip) }))
            .await?;
        Ok(true)
    }

    async fn push_ipv4_update(
        &self,
        original: &Subnet,
        updated: &Subnet,
        path: &str,
        ledger: &mut Ledger,
    ) -> OrchResult<bool> {
        let mut body = VsdObject::new();
        let mut released = Vec::new();
        if !original.enable_dhcp && updated.enable_dhcp {
            let ip = updated.last_pool_address().ok_or_else(|| {
                OrchError::validation(format!("Subnet {} has no allocation pool for the DHCP address", updated.id))
            })?;
            self.reserve_ip(updated, ip, ledger)?;
            body.set("gateway", ip.to_string());
        } else if original.enable_dhcp && !updated.enable_dhcp {
            body.set("gateway", Value::Null);
            released = self.catalog.ports_on_subnet(&updated.id, DEVICE_OWNER_DHCP_NUAGE)?;
        }
        if dhcp_options_changed(original, updated) {
            body.set("dhcpOptions", dhcp_options(updated));
        }
        if original.name != updated.name {
            body.set("description", updated.name.clone());
        }
        if body.as_map().is_empty() {
            return Ok(false);
        }
        self.client.put(path, body.into_value()).await?;
        self.delete_gateway_ports(&released)?;
        Ok(true)
    }

    async fn update_shared_resource(&mut self, subnet: &mut Subnet) -> OrchResult<()> {
        let Some(resource) = self.find_shared_resource(&subnet.id).await? else {
            warn!("no shared resource backs this external subnet");
            return Ok(());
        };
        let id = resource.require_id()?;
        let body = json!({
            "description": subnet.name,
            "gateway": ip_string(subnet.gateway_ip),
        });
        self.client
            .put(&Resource::SharedNetworkResource.object_path(&id), body)
            .await?;
        subnet.underlay = resource.bool("underlay");
        self.stats.updates += 1;
        audit_log!(AuditRecord::new(AuditCategory::ResourceModify, "SubnetLifecycle", "update_shared_resource")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&id)
            .with_object_type("sharednetworkresource"));
        Ok(())
    }

    /// Removes the VSD side of a subnet along with the local subnet.
    #[instrument(skip(self, subnet), fields(subnet = %subnet.id))]
    pub async fn delete(&mut self, subnet: &Subnet) -> OrchResult<()> {
        // The mapping goes with the local subnet, so read it first.
        let mapping = self.store.subnet_mapping(&subnet.id)?;
        let gateway_ports = self.catalog.ports_on_subnet(&subnet.id, DEVICE_OWNER_DHCP_NUAGE)?;
        let external = self
            .catalog
            .network(&subnet.network_id)?
            .is_some_and(|n| n.external);
        self.catalog.delete_subnet(&subnet.id)?;

        if external {
            self.delete_shared_resource(&subnet.id).await?;
        }
        let Some(mapping) = mapping else {
            return Ok(());
        };

        if mapping.vsd_managed {
            self.release_tenant_group(subnet, &mapping).await?;
        } else if subnet.is_ipv6() {
            let body = json!({
                "IPType": "IPV4",
                "IPv6Address": Value::Null,
                "IPv6Gateway": Value::Null,
                "enableDHCPv6": false,
            });
            self.client
                .put(&mapping_resource(&mapping).object_path(&mapping.nuage_subnet_id), body)
                .await?;
            debug!(l2domain = %mapping.nuage_subnet_id, "dropped IPv6 from L2 domain");
        } else {
            self.delete_l2domain(&mapping).await?;
        }
        self.delete_gateway_ports(&gateway_ports)?;

        let event = LifecycleEvent::Subnet {
            phase: EventPhase::AfterDelete,
            subnet: subnet.clone(),
            mapping: Some(mapping),
        };
        self.notifier.dispatch(&event, &self.compensator()).await
    }

    async fn delete_shared_resource(&mut self, subnet_id: &str) -> OrchResult<()> {
        let Some(resource) = self.find_shared_resource(subnet_id).await? else {
            return Ok(());
        };
        let id = resource.require_id()?;
        self.client
            .delete(&Resource::SharedNetworkResource.object_path(&id))
            .await?;
        self.stats.shared_resources_deleted += 1;
        info!(shared_resource = %id, "deleted floating IP shared resource");
        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "SubnetLifecycle", "delete_shared_resource")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&id)
            .with_object_type("sharednetworkresource"));
        Ok(())
    }

    async fn delete_l2domain(&mut self, mapping: &SubnetMapping) -> OrchResult<()> {
        self.client
            .delete(&mapping_resource(mapping).object_path(&mapping.nuage_subnet_id))
            .await?;
        if let Some(template) = &mapping.nuage_l2dom_tmplt_id {
            self.client
                .delete(&Resource::L2DomainTemplate.object_path(template))
                .await?;
        }
        if let Some(ipv6) = self
            .store
            .mapping_by_nuage_id_and_version(&mapping.nuage_subnet_id, IpVersion::V6)?
        {
            self.store.delete_mapping(&ipv6.subnet_id)?;
        }
        self.stats.l2domains_deleted += 1;
        info!(l2domain = %mapping.nuage_subnet_id, "deleted L2 domain");
        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "SubnetLifecycle", "delete_l2domain")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&mapping.nuage_subnet_id)
            .with_object_type("l2domain"));
        Ok(())
    }

    /// Revokes the tenant permission unless another subnet of the same
    /// tenant still links the VSD subnet.
    async fn release_tenant_group(&self, subnet: &Subnet, mapping: &SubnetMapping) -> OrchResult<()> {
        let still_used = self
            .store
            .mappings_by_nuage_id(&mapping.nuage_subnet_id)?
            .iter()
            .any(|other| other.subnet_id != subnet.id && other.tenant_id == mapping.tenant_id);
        if still_used {
            debug!(nuage_subnet = %mapping.nuage_subnet_id, "permission still used by the tenant");
            return Ok(());
        }
        if let Some(permission) = &mapping.nuage_permission_id {
            self.client
                .delete(&Resource::Permission.object_path(permission))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use nuage_orch_test::{seed_enterprise, seed_l2domain, FakeVsd, Fault, L2DomainOptions, CMS_ID};
    use nuage_vsd::{IgnoreErrors, RestError, RestMethod};
    use pretty_assertions::assert_eq;

    struct Harness {
        vsd: Arc<IgnoreErrors<FakeVsd>>,
        store: Arc<InMemoryStore>,
        lifecycle: SubnetLifecycle,
        enterprise: String,
    }

    impl Harness {
        fn new() -> Self {
            let vsd = Arc::new(IgnoreErrors::new(FakeVsd::new()));
            let enterprise = seed_enterprise(vsd.inner(), "acme");
            let store = Arc::new(InMemoryStore::new());
            store
                .add_net_partition(NetPartition {
                    id: enterprise.clone(),
                    name: "acme".to_string(),
                })
                .unwrap();
            let config = SubnetLifecycleConfig {
                cms_id: CMS_ID.to_string(),
                default_net_partition: Some("acme".to_string()),
                dualstack_retry: RetryPolicy::immediate(3),
            };
            let lifecycle = SubnetLifecycle::new(config, vsd.clone(), store.clone(), store.clone());
            Self {
                vsd,
                store,
                lifecycle,
                enterprise,
            }
        }

        fn fake(&self) -> &FakeVsd {
            self.vsd.inner()
        }

        fn with_network(self, network: Network) -> Self {
            self.store.put_network(network);
            self
        }

        async fn create(&mut self, subnet: &mut Subnet) -> OrchResult<Option<SubnetMapping>> {
            self.store.put_subnet(subnet.clone());
            self.lifecycle.create(subnet).await
        }
    }

    fn vxlan(id: &str) -> Network {
        Network {
            id: id.to_string(),
            tenant_id: "t-1".to_string(),
            provider_network_type: Some("vxlan".to_string()),
            ..Default::default()
        }
    }

    fn v4(id: &str) -> Subnet {
        let mut subnet = Subnet::new(id, "n-1", "10.0.0.0/24".parse().unwrap(), Some("10.0.0.1".parse().unwrap()));
        subnet.tenant_id = "t-1".to_string();
        subnet
    }

    fn v6(id: &str) -> Subnet {
        let mut subnet = Subnet::new(
            id,
            "n-1",
            "2001:db8::/64".parse().unwrap(),
            Some("2001:db8::1".parse().unwrap()),
        );
        subnet.tenant_id = "t-1".to_string();
        subnet
    }

    fn linked(mut subnet: Subnet, nuagenet: &str) -> Subnet {
        subnet.nuagenet = Some(nuagenet.to_string());
        subnet.net_partition = Some("acme".to_string());
        subnet
    }

    #[tokio::test]
    async fn test_ipv4_subnet_provisions_l2domain() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let mut subnet = v4("s4");

        let mapping = h.create(&mut subnet).await.unwrap().unwrap();

        let l2domain = h.fake().object(&mapping.nuage_subnet_id).unwrap();
        assert_eq!(l2domain.parent_id(), Some(h.enterprise.as_str()));
        assert_eq!(l2domain.str("IPType"), Some("IPV4"));
        assert_eq!(l2domain.str("gateway"), Some("10.0.0.254"));
        assert_eq!(l2domain.external_id(), Some("s4@cms-test"));
        assert!(mapping.nuage_l2dom_tmplt_id.is_some());
        assert_eq!(h.fake().children(&mapping.nuage_subnet_id, Resource::IngressAclTemplate).len(), 1);
        assert_eq!(h.fake().children(&mapping.nuage_subnet_id, Resource::EgressAclTemplate).len(), 1);
        assert_eq!(h.fake().children(&mapping.nuage_subnet_id, Resource::IngressAdvFwdTemplate).len(), 1);
        assert_eq!(h.fake().children(&mapping.nuage_subnet_id, Resource::Permission).len(), 1);
        assert_eq!(h.fake().children(&h.enterprise, Resource::Group).len(), 1);

        let ports = h.store.ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].device_owner, DEVICE_OWNER_DHCP_NUAGE);
        assert_eq!(ports[0].fixed_ips[0].ip_address, "10.0.0.254".parse().unwrap());

        assert_eq!(subnet.nuagenet.as_deref(), Some(mapping.nuage_subnet_id.as_str()));
        assert_eq!(subnet.net_partition.as_deref(), Some(h.enterprise.as_str()));
        assert_eq!(h.store.subnet_mapping("s4").unwrap(), Some(mapping));
        assert_eq!(h.lifecycle.stats().l2domains_created, 1);
    }

    #[tokio::test]
    async fn test_dhcp_disabled_reserves_nothing() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let mut subnet = v4("s4");
        subnet.enable_dhcp = false;

        let mapping = h.create(&mut subnet).await.unwrap().unwrap();

        assert!(h.store.ports().is_empty());
        let l2domain = h.fake().object(&mapping.nuage_subnet_id).unwrap();
        assert_eq!(l2domain.bool("DHCPManaged"), Some(false));
        assert_eq!(l2domain.get("gateway"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_ipv6_after_ipv4_joins_the_l2domain() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let ipv4 = h.create(&mut v4("s4")).await.unwrap().unwrap();

        let mut subnet = v6("s6");
        let ipv6 = h.create(&mut subnet).await.unwrap().unwrap();

        assert_eq!(ipv6.nuage_subnet_id, ipv4.nuage_subnet_id);
        assert_eq!(ipv6.ip_version, IpVersion::V6);
        assert_eq!(h.fake().count(Resource::L2Domain), 1);
        let l2domain = h.fake().object(&ipv4.nuage_subnet_id).unwrap();
        assert_eq!(l2domain.str("IPType"), Some("DUALSTACK"));
        assert_eq!(l2domain.str("IPv6Address"), Some("2001:db8::/64"));
        assert_eq!(l2domain.str("IPv6Gateway"), Some("2001:db8::1"));
        assert_eq!(h.lifecycle.stats().dualstack_links, 1);
    }

    #[tokio::test]
    async fn test_ipv6_before_ipv4_is_provisioned_with_it() {
        let mut h = Harness::new().with_network(vxlan("n-1"));

        let deferred = h.create(&mut v6("s6")).await.unwrap();
        assert_eq!(deferred, None);
        assert_eq!(h.fake().mutating_requests(), 0);

        let ipv4 = h.create(&mut v4("s4")).await.unwrap().unwrap();

        let ipv6 = h.store.subnet_mapping("s6").unwrap().unwrap();
        assert_eq!(ipv6.nuage_subnet_id, ipv4.nuage_subnet_id);
        assert_eq!(ipv6.ip_version, IpVersion::V6);
        let l2domain = h.fake().object(&ipv4.nuage_subnet_id).unwrap();
        assert_eq!(l2domain.str("IPType"), Some("DUALSTACK"));
    }

    #[tokio::test]
    async fn test_ipv6_gives_up_when_ipv4_mapping_never_appears() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        // The IPv4 subnet exists locally but was never provisioned.
        h.store.put_subnet(v4("s4"));

        let err = h.create(&mut v6("s6")).await.unwrap_err();

        assert_eq!(err.to_string(), "Failed to create subnet on vsd");
        assert_eq!(h.fake().mutating_requests(), 0);
        assert_eq!(h.store.subnet_mapping("s6").unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_provisioning_is_unwound() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        h.fake().inject(Fault::new(
            RestMethod::Post,
            "/egressacltemplates",
            RestError::new(500, "boom"),
        ));

        let err = h.create(&mut v4("s4")).await.unwrap_err();

        assert!(matches!(err, OrchError::Remote(_)), "{err}");
        assert_eq!(h.fake().count(Resource::L2Domain), 0);
        assert_eq!(h.fake().count(Resource::L2DomainTemplate), 0);
        assert!(h.store.ports().is_empty());
        assert_eq!(h.store.subnet_mapping("s4").unwrap(), None);
    }

    #[tokio::test]
    async fn test_mixing_managed_kinds_is_rejected_before_remote_calls() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let ipv4 = h.create(&mut v4("s4")).await.unwrap().unwrap();
        h.fake().clear_requests();

        let err = h
            .create(&mut linked(v6("s6"), &ipv4.nuage_subnet_id))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Bad request: Can't mix openstack and vsd managed subnets under 1 network."
        );
        assert!(h.fake().requests().is_empty());
    }

    #[tokio::test]
    async fn test_vsd_managed_subnet_links_existing_l2domain() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let l2 = seed_l2domain(h.fake(), &h.enterprise, L2DomainOptions::default());
        let mut subnet = linked(v4("s4"), &l2.l2domain);

        let mapping = h.create(&mut subnet).await.unwrap().unwrap();

        assert!(mapping.vsd_managed);
        assert_eq!(mapping.kind, VsdSubnetKind::L2Domain);
        assert_eq!(mapping.nuage_subnet_id, l2.l2domain);
        assert!(subnet.vsd_managed);
        assert_eq!(subnet.gateway_ip, None);
        assert_eq!(subnet.allocation_pools[0].start, "10.0.0.1".parse().unwrap());
        assert_eq!(h.fake().count(Resource::L2Domain), 1);

        let permissions = h.fake().children(&l2.l2domain, Resource::Permission);
        assert_eq!(permissions.len(), 1);
        assert_eq!(permissions[0].str("permittedEntityID"), mapping.nuage_group_id.as_deref());

        let ports = h.store.ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].id, "s4-dhcp-10.0.0.1");
    }

    #[tokio::test]
    async fn test_vsd_managed_refreshes_stale_net_partition() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        h.store.delete_net_partition(&h.enterprise).unwrap();
        h.store
            .add_net_partition(NetPartition {
                id: "stale".to_string(),
                name: "acme".to_string(),
            })
            .unwrap();
        let l2 = seed_l2domain(h.fake(), &h.enterprise, L2DomainOptions::default());

        h.create(&mut linked(v4("s4"), &l2.l2domain)).await.unwrap();

        let partition = h.store.net_partition_by_name("acme").unwrap().unwrap();
        assert_eq!(partition.id, h.enterprise);
        assert_eq!(h.store.net_partition("stale").unwrap(), None);
    }

    #[tokio::test]
    async fn test_vsd_managed_subnet_in_other_partition_is_rejected() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let other = seed_enterprise(h.fake(), "other");
        let l2 = seed_l2domain(h.fake(), &other, L2DomainOptions::default());

        let err = h.create(&mut linked(v4("s4"), &l2.l2domain)).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "Bad request: Provided Nuage subnet not in the provided Nuage net-partition"
        );
        assert_eq!(h.fake().mutating_requests(), 0);
    }

    #[tokio::test]
    async fn test_vsd_managed_cidr_mismatch_is_rejected() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let l2 = seed_l2domain(h.fake(), &h.enterprise, L2DomainOptions::default());
        let mut subnet = linked(v4("s4"), &l2.l2domain);
        subnet.cidr = "10.9.0.0/24".parse().unwrap();
        subnet.gateway_ip = None;

        let err = h.create(&mut subnet).await.unwrap_err();

        assert!(matches!(err, OrchError::Validation(_)), "{err}");
        assert_eq!(h.store.subnet_mapping("s4").unwrap(), None);
    }

    #[tokio::test]
    async fn test_vsd_managed_failure_revokes_permission() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let l2 = seed_l2domain(h.fake(), &h.enterprise, L2DomainOptions::default());
        // Occupies the id of the DHCP reservation.
        h.store
            .put_port(Port::new("s4-dhcp-10.0.0.1", "n-1", MacAddress::new([0xfa, 0x16, 0x3e, 0, 0, 1])));

        let err = h.create(&mut linked(v4("s4"), &l2.l2domain)).await.unwrap_err();

        assert!(matches!(err, OrchError::Store(_)), "{err}");
        assert!(h.fake().children(&l2.l2domain, Resource::Permission).is_empty());
        assert_eq!(h.fake().children(&h.enterprise, Resource::Group).len(), 1);
        assert_eq!(h.store.subnet_mapping("s4").unwrap(), None);
        assert_eq!(h.lifecycle.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_external_subnet_uses_shared_resource() {
        let mut network = vxlan("n-1");
        network.external = true;
        let mut h = Harness::new().with_network(network);
        let mut subnet = v4("s4");

        assert_eq!(h.create(&mut subnet).await.unwrap(), None);

        let shared = h.fake().objects(Resource::SharedNetworkResource);
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].str("type"), Some("FLOATING"));
        assert_eq!(shared[0].external_id(), Some("s4@cms-test"));
        assert_eq!(subnet.underlay, Some(false));

        let err = h.create(&mut v6("s6")).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Bad request: Subnet with ip_version 6 is currently not supported for router:external networks."
        );
        h.store.delete_subnet("s6").unwrap();

        let mut second = v4("s4b");
        second.cidr = "10.5.0.0/24".parse().unwrap();
        second.gateway_ip = None;
        let err = h.create(&mut second).await.unwrap_err();
        assert_eq!(err.to_string(), "Bad request: Only one subnet is allowed per external network n-1");
        h.store.delete_subnet("s4b").unwrap();

        h.lifecycle.delete(&subnet).await.unwrap();
        assert_eq!(h.fake().count(Resource::SharedNetworkResource), 0);
    }

    #[tokio::test]
    async fn test_update_of_vsd_managed_subnet_is_rejected() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let l2 = seed_l2domain(h.fake(), &h.enterprise, L2DomainOptions::default());
        let mut subnet = linked(v4("s4"), &l2.l2domain);
        h.create(&mut subnet).await.unwrap();

        let original = subnet.clone();
        subnet.name = "renamed".to_string();
        let err = h.lifecycle.update(&original, &mut subnet).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "Bad request: Subnet s4 is a VSD-managed subnet. Update is not supported."
        );
    }

    #[tokio::test]
    async fn test_update_toggles_dhcp_reservation() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let mut subnet = v4("s4");
        let mapping = h.create(&mut subnet).await.unwrap().unwrap();

        let original = subnet.clone();
        subnet.enable_dhcp = false;
        h.lifecycle.update(&original, &mut subnet).await.unwrap();
        assert!(h.store.ports().is_empty());
        let l2domain = h.fake().object(&mapping.nuage_subnet_id).unwrap();
        assert_eq!(l2domain.get("gateway"), Some(&Value::Null));

        let original = subnet.clone();
        subnet.enable_dhcp = true;
        h.lifecycle.update(&original, &mut subnet).await.unwrap();
        assert_eq!(h.store.ports().len(), 1);
        let l2domain = h.fake().object(&mapping.nuage_subnet_id).unwrap();
        assert_eq!(l2domain.str("gateway"), Some("10.0.0.254"));
        assert_eq!(h.lifecycle.stats().updates, 2);
    }

    #[tokio::test]
    async fn test_ipv6_update_only_pushes_gateway_changes() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let ipv4 = h.create(&mut v4("s4")).await.unwrap().unwrap();
        let mut subnet = v6("s6");
        h.create(&mut subnet).await.unwrap();
        h.fake().clear_requests();

        let original = subnet.clone();
        subnet.name = "renamed".to_string();
        h.lifecycle.update(&original, &mut subnet).await.unwrap();
        assert!(h.fake().requests().is_empty());

        let original = subnet.clone();
        subnet.gateway_ip = Some("2001:db8::fe".parse().unwrap());
        h.lifecycle.update(&original, &mut subnet).await.unwrap();
        assert_eq!(h.fake().requests_matching(RestMethod::Put, "/l2domains/"), 1);
        let l2domain = h.fake().object(&ipv4.nuage_subnet_id).unwrap();
        assert_eq!(l2domain.str("IPv6Gateway"), Some("2001:db8::fe"));
    }

    #[tokio::test]
    async fn test_delete_ipv4_removes_l2domain_and_ipv6_mapping() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let ipv4 = v4("s4");
        h.create(&mut ipv4.clone()).await.unwrap();
        h.create(&mut v6("s6")).await.unwrap();

        h.lifecycle.delete(&ipv4).await.unwrap();

        assert_eq!(h.fake().count(Resource::L2Domain), 0);
        assert_eq!(h.fake().count(Resource::L2DomainTemplate), 0);
        assert_eq!(h.fake().count(Resource::IngressAclTemplate), 0);
        assert_eq!(h.store.subnet_mapping("s6").unwrap(), None);
        assert!(h.store.ports().is_empty());
        assert_eq!(h.lifecycle.stats().l2domains_deleted, 1);
    }

    #[tokio::test]
    async fn test_delete_ipv6_reverts_l2domain_to_ipv4() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let ipv4 = h.create(&mut v4("s4")).await.unwrap().unwrap();
        let ipv6 = v6("s6");
        h.create(&mut ipv6.clone()).await.unwrap();

        h.lifecycle.delete(&ipv6).await.unwrap();

        let l2domain = h.fake().object(&ipv4.nuage_subnet_id).unwrap();
        assert_eq!(l2domain.str("IPType"), Some("IPV4"));
        assert_eq!(l2domain.get("IPv6Address"), Some(&Value::Null));
        assert!(h.store.subnet_mapping("s4").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_vsd_managed_delete_keeps_permission_for_tenant_sibling() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let options = L2DomainOptions::default().with_ipv6("2001:db8::/64", "2001:db8::1");
        let l2 = seed_l2domain(h.fake(), &h.enterprise, options);
        let ipv4 = linked(v4("s4"), &l2.l2domain);
        let ipv6 = linked(v6("s6"), &l2.l2domain);
        h.create(&mut ipv4.clone()).await.unwrap();
        h.create(&mut ipv6.clone()).await.unwrap();
        assert_eq!(h.fake().children(&l2.l2domain, Resource::Permission).len(), 1);

        h.lifecycle.delete(&ipv4).await.unwrap();
        assert_eq!(h.fake().children(&l2.l2domain, Resource::Permission).len(), 1);

        h.lifecycle.delete(&ipv6).await.unwrap();
        assert!(h.fake().children(&l2.l2domain, Resource::Permission).is_empty());
        assert!(h.fake().object(&l2.l2domain).is_some());
    }

    #[test]
    fn test_validate_create_messages() {
        let h = Harness::new();
        let network = vxlan("n-1");
        h.store.put_network(network.clone());

        let mut subnet = v4("s4");
        subnet.nuagenet = Some("l2".to_string());
        let err = h.lifecycle.validate_create(&subnet, &network).unwrap_err();
        assert_eq!(err.to_string(), "Bad request: Parameter net-partition required when passing nuagenet");

        let mut subnet = v6("s6");
        subnet.ipv6_address_mode = Some("slaac".to_string());
        let err = h.lifecycle.validate_create(&subnet, &network).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Bad request: Attribute ipv6_address_mode must be 'dhcpv6-stateful' or not set."
        );

        let mut subnet = v4("s4");
        subnet.gateway_ip = Some("10.9.9.9".parse().unwrap());
        let err = h.lifecycle.validate_create(&subnet, &network).unwrap_err();
        assert_eq!(err.to_string(), "Bad request: Gateway IP outside of the subnet CIDR");

        let mut subnet = v4("s4");
        subnet.underlay = Some(true);
        let err = h.lifecycle.validate_create(&subnet, &network).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Bad request: underlay attribute can not be set for internal subnets"
        );
    }

    #[test]
    fn test_validate_create_skips_non_vxlan_networks() {
        let h = Harness::new();
        let vlan = Network {
            id: "n-1".to_string(),
            provider_network_type: Some("vlan".to_string()),
            ..Default::default()
        };

        assert!(!h.lifecycle.validate_create(&v4("s4"), &vlan).unwrap());

        let mut subnet = v4("s4");
        subnet.net_partition = Some("acme".to_string());
        let err = h.lifecycle.validate_create(&subnet, &vlan).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Bad request: Network should have 'provider:network_type' vxlan or have such a segment"
        );
    }

    #[test]
    fn test_validate_create_limits_dual_stack_pairs() {
        let h = Harness::new().with_network(vxlan("n-1"));
        h.store.put_subnet(v4("s4"));
        h.store.put_subnet(v6("s6"));

        let err = h.lifecycle.validate_create(&v6("s6b"), &vxlan("n-1")).unwrap_err();

        assert_eq!(
            err.to_string(),
            "Bad request: A network with an ipv6 subnet may only have maximum 1 ipv4 and 1 ipv6 subnet"
        );
    }

    #[tokio::test]
    async fn test_missing_net_partition_is_reported() {
        let mut h = Harness::new().with_network(vxlan("n-1"));
        let mut subnet = v4("s4");
        subnet.net_partition = Some("nowhere".to_string());

        let err = h.create(&mut subnet).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "Bad request: Either net_partition is not provided with subnet OR default net_partition is not created at the start"
        );
        assert!(h.fake().requests().is_empty());
    }
}
