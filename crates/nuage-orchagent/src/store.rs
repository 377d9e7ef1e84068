//! Local persistence interfaces and an in-memory implementation.
//!
//! [`LocalMappingStore`] holds what this agent records about the VSD: subnet
//! mappings, net partitions and security group flags. [`NetworkCatalog`] is
//! the read side of the cloud's own network model plus the two port writes
//! the subnet lifecycle needs (DHCP address reservations).
//!
//! Both traits are synchronous. Deleting a subnet cascades to its mapping,
//! which is why the subnet lifecycle reads the mapping before deleting.

use crate::error::{OrchError, OrchResult};
use crate::port::types::Port;
use crate::subnet::types::{Network, Subnet};
use nuage_types::IpVersion;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// What a local subnet is linked to on the VSD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VsdSubnetKind {
    L2Domain,
    /// A subnet of an L3 domain.
    Subnet,
    SharedResource,
}

/// Association between a local subnet and its VSD counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetMapping {
    pub subnet_id: String,
    pub network_id: String,
    pub nuage_subnet_id: String,
    /// Template of an agent-created L2 domain.
    pub nuage_l2dom_tmplt_id: Option<String>,
    pub net_partition_id: String,
    pub ip_version: IpVersion,
    /// Linked to a pre-existing VSD subnet rather than provisioned here.
    pub vsd_managed: bool,
    pub kind: VsdSubnetKind,
    /// Tenant group granted use of the VSD subnet.
    pub nuage_group_id: Option<String>,
    /// Permission object backing the grant.
    pub nuage_permission_id: Option<String>,
    pub tenant_id: String,
}

impl SubnetMapping {
    pub fn is_l2domain(&self) -> bool {
        self.kind == VsdSubnetKind::L2Domain
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetPartition {
    /// VSD enterprise id.
    pub id: String,
    pub name: String,
}

pub trait LocalMappingStore: Send + Sync {
    fn subnet_mapping(&self, subnet_id: &str) -> OrchResult<Option<SubnetMapping>>;

    fn mappings_by_nuage_id(&self, nuage_subnet_id: &str) -> OrchResult<Vec<SubnetMapping>>;

    fn mapping_by_nuage_id_and_version(
        &self,
        nuage_subnet_id: &str,
        version: IpVersion,
    ) -> OrchResult<Option<SubnetMapping>>;

    fn mappings_by_network(&self, network_id: &str) -> OrchResult<Vec<SubnetMapping>>;

    fn add_mapping(&self, mapping: SubnetMapping) -> OrchResult<()>;

    fn update_mapping(&self, mapping: SubnetMapping) -> OrchResult<()>;

    fn delete_mapping(&self, subnet_id: &str) -> OrchResult<Option<SubnetMapping>>;

    fn net_partition(&self, id: &str) -> OrchResult<Option<NetPartition>>;

    fn net_partition_by_name(&self, name: &str) -> OrchResult<Option<NetPartition>>;

    fn add_net_partition(&self, partition: NetPartition) -> OrchResult<()>;

    fn delete_net_partition(&self, id: &str) -> OrchResult<()>;

    /// The `stateful` parameter of a security group; true when unset.
    fn sg_stateful(&self, sg_id: &str) -> OrchResult<bool>;

    /// VSD domain id of a router.
    fn router_domain(&self, router_id: &str) -> OrchResult<Option<String>>;
}

pub trait NetworkCatalog: Send + Sync {
    fn network(&self, id: &str) -> OrchResult<Option<Network>>;

    fn subnet(&self, id: &str) -> OrchResult<Option<Subnet>>;

    fn subnets_of_network(&self, network_id: &str) -> OrchResult<Vec<Subnet>>;

    /// Deletes a subnet and, by cascade, its mapping.
    fn delete_subnet(&self, id: &str) -> OrchResult<()>;

    fn ports_of_device(&self, device_id: &str) -> OrchResult<Vec<Port>>;

    /// Ports with a fixed IP on `subnet_id` and the given owner.
    fn ports_on_subnet(&self, subnet_id: &str, device_owner: &str) -> OrchResult<Vec<Port>>;

    fn create_port(&self, port: Port) -> OrchResult<Port>;

    fn delete_port(&self, port_id: &str) -> OrchResult<()>;
}

#[derive(Debug, Default)]
struct Tables {
    networks: BTreeMap<String, Network>,
    subnets: BTreeMap<String, Subnet>,
    ports: BTreeMap<String, Port>,
    mappings: BTreeMap<String, SubnetMapping>,
    partitions: BTreeMap<String, NetPartition>,
    sg_stateful: HashMap<String, bool>,
    router_domains: HashMap<String, String>,
}

/// Process-local store backing both traits.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn put_network(&self, network: Network) {
        self.lock().networks.insert(network.id.clone(), network);
    }

    pub fn put_subnet(&self, subnet: Subnet) {
        self.lock().subnets.insert(subnet.id.clone(), subnet);
    }

    pub fn put_port(&self, port: Port) {
        self.lock().ports.insert(port.id.clone(), port);
    }

    pub fn port(&self, id: &str) -> Option<Port> {
        self.lock().ports.get(id).cloned()
    }

    pub fn ports(&self) -> Vec<Port> {
        self.lock().ports.values().cloned().collect()
    }

    pub fn set_sg_stateful(&self, sg_id: &str, stateful: bool) {
        self.lock().sg_stateful.insert(sg_id.to_string(), stateful);
    }

    pub fn set_router_domain(&self, router_id: &str, domain_id: &str) {
        self.lock()
            .router_domains
            .insert(router_id.to_string(), domain_id.to_string());
    }
}

impl LocalMappingStore for InMemoryStore {
    fn subnet_mapping(&self, subnet_id: &str) -> OrchResult<Option<SubnetMapping>> {
        Ok(self.lock().mappings.get(subnet_id).cloned())
    }

    fn mappings_by_nuage_id(&self, nuage_subnet_id: &str) -> OrchResult<Vec<SubnetMapping>> {
        Ok(self
            .lock()
            .mappings
            .values()
            .filter(|m| m.nuage_subnet_id == nuage_subnet_id)
            .cloned()
            .collect())
    }

    fn mapping_by_nuage_id_and_version(
        &self,
        nuage_subnet_id: &str,
        version: IpVersion,
    ) -> OrchResult<Option<SubnetMapping>> {
        Ok(self
            .lock()
            .mappings
            .values()
            .find(|m| m.nuage_subnet_id == nuage_subnet_id && m.ip_version == version)
            .cloned())
    }

    fn mappings_by_network(&self, network_id: &str) -> OrchResult<Vec<SubnetMapping>> {
        Ok(self
            .lock()
            .mappings
            .values()
            .filter(|m| m.network_id == network_id)
            .cloned()
            .collect())
    }

    fn add_mapping(&self, mapping: SubnetMapping) -> OrchResult<()> {
        let mut tables = self.lock();
        if tables.mappings.contains_key(&mapping.subnet_id) {
            return Err(OrchError::Store(format!(
                "subnet {} is already mapped",
                mapping.subnet_id
            )));
        }
        tables.mappings.insert(mapping.subnet_id.clone(), mapping);
        Ok(())
    }

    fn update_mapping(&self, mapping: SubnetMapping) -> OrchResult<()> {
        let mut tables = self.lock();
        match tables.mappings.get_mut(&mapping.subnet_id) {
            Some(existing) => {
                *existing = mapping;
                Ok(())
            }
            None => Err(OrchError::Store(format!("subnet {} is not mapped", mapping.subnet_id))),
        }
    }

    fn delete_mapping(&self, subnet_id: &str) -> OrchResult<Option<SubnetMapping>> {
        Ok(self.lock().mappings.remove(subnet_id))
    }

    fn net_partition(&self, id: &str) -> OrchResult<Option<NetPartition>> {
        Ok(self.lock().partitions.get(id).cloned())
    }

    fn net_partition_by_name(&self, name: &str) -> OrchResult<Option<NetPartition>> {
        Ok(self
            .lock()
            .partitions
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    fn add_net_partition(&self, partition: NetPartition) -> OrchResult<()> {
        self.lock().partitions.insert(partition.id.clone(), partition);
        Ok(())
    }

    fn delete_net_partition(&self, id: &str) -> OrchResult<()> {
        self.lock().partitions.remove(id);
        Ok(())
    }

    fn sg_stateful(&self, sg_id: &str) -> OrchResult<bool> {
        Ok(self.lock().sg_stateful.get(sg_id).copied().unwrap_or(true))
    }

    fn router_domain(&self, router_id: &str) -> OrchResult<Option<String>> {
        Ok(self.lock().router_domains.get(router_id).cloned())
    }
}

impl NetworkCatalog for InMemoryStore {
    fn network(&self, id: &str) -> OrchResult<Option<Network>> {
        Ok(self.lock().networks.get(id).cloned())
    }

    fn subnet(&self, id: &str) -> OrchResult<Option<Subnet>> {
        Ok(self.lock().subnets.get(id).cloned())
    }

    fn subnets_of_network(&self, network_id: &str) -> OrchResult<Vec<Subnet>> {
        Ok(self
            .lock()
            .subnets
            .values()
            .filter(|s| s.network_id == network_id)
            .cloned()
            .collect())
    }

    fn delete_subnet(&self, id: &str) -> OrchResult<()> {
        let mut tables = self.lock();
        tables.subnets.remove(id);
        tables.mappings.remove(id);
        Ok(())
    }

    fn ports_of_device(&self, device_id: &str) -> OrchResult<Vec<Port>> {
        Ok(self
            .lock()
            .ports
            .values()
            .filter(|p| !device_id.is_empty() && p.device_id == device_id)
            .cloned()
            .collect())
    }

    fn ports_on_subnet(&self, subnet_id: &str, device_owner: &str) -> OrchResult<Vec<Port>> {
        Ok(self
            .lock()
            .ports
            .values()
            .filter(|p| p.device_owner == device_owner)
            .filter(|p| p.fixed_ips.iter().any(|ip| ip.subnet_id == subnet_id))
            .cloned()
            .collect())
    }

    fn create_port(&self, port: Port) -> OrchResult<Port> {
        let mut tables = self.lock();
        if tables.ports.contains_key(&port.id) {
            return Err(OrchError::Store(format!("port {} already exists", port.id)));
        }
        tables.ports.insert(port.id.clone(), port.clone());
        Ok(port)
    }

    fn delete_port(&self, port_id: &str) -> OrchResult<()> {
        self.lock().ports.remove(port_id);
        Ok(())
    }
}
