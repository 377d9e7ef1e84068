//! External security groups.
//!
//! An external group is a policy group flagged `external` that stands for
//! endpoints outside the cloud, optionally tagged with an EVPN community.
//! Its rules are ACL entries whose remote side is the external group and
//! whose location is the policy group of a regular security group.
//! Unlike security group rules, an external rule lands in the template named
//! like its direction.

use std::sync::Arc;

use super::mapper::{MappingTarget, ResolvedRemote, RuleMapper};
use super::policy_group::{acl_template, create_group, PolicyGroupConfig};
use super::priority::PriorityAllocator;
use super::types::{AclDirection, Direction, PolicyGroupKind, Protocol, ProtocolSpec, SecurityRule};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::error::{OrchError, OrchResult};
use crate::store::LocalMappingStore;
use crate::vsd::{self, Creation, ParentContext, ParentDomain};
use nuage_vsd::{NuageFilter, RemoteControllerClient, Resource, VsdObject};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

const EXTERNAL_GROUP: &str = "nuage-external-security-group";
const EXTERNAL_RULE: &str = "nuage-external-security-group-rule";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub extended_community_id: Option<String>,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub router_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalGroup {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub extended_community_id: Option<String>,
    pub parent: ParentDomain,
    pub external_id: Option<String>,
}

impl ExternalGroup {
    fn from_object(object: &VsdObject) -> OrchResult<Self> {
        let id = object.require_id()?;
        let parent = ParentDomain::of(object)
            .ok_or_else(|| OrchError::Internal(format!("external group {} has no domain", id)))?;
        Ok(Self {
            name: object.name().unwrap_or_default().to_string(),
            description: object.str("description").map(str::to_string),
            extended_community_id: object.str("EVPNCommunityTag").map(str::to_string),
            external_id: object.external_id().map(str::to_string),
            parent,
            id,
        })
    }
}

/// Selection for [`ExternalGroupManager::list_groups`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalGroupQuery {
    All,
    Id(String),
    Name(String),
    Subnet(String),
    Router(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRuleRequest {
    pub external_group_id: String,
    pub direction: Direction,
    /// Security group whose policy group the rule applies to.
    pub origin_group_id: String,
    #[serde(default)]
    pub ethertype: Option<String>,
    #[serde(default)]
    pub protocol: Option<ProtocolSpec>,
    #[serde(default)]
    pub port_range_min: Option<u32>,
    #[serde(default)]
    pub port_range_max: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRule {
    pub id: String,
    pub direction: Direction,
    pub protocol: Protocol,
    pub port_range_min: Option<String>,
    pub port_range_max: Option<String>,
    /// Name of the policy group the entry is located on.
    pub origin_group_id: Option<String>,
    /// Name of the policy group on the remote side.
    pub remote_group_id: Option<String>,
}

/// Splits a `destinationPort` attribute back into a range.
fn split_port_range(port: Option<&str>) -> (Option<String>, Option<String>) {
    match port {
        None | Some("*") => (None, None),
        Some(range) => match range.split_once('-') {
            Some((min, max)) => (Some(min.to_string()), Some(max.to_string())),
            None => (Some(range.to_string()), Some(range.to_string())),
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExternalGroupStats {
    pub groups_created: u64,
    pub groups_deleted: u64,
    pub rules_created: u64,
    pub rules_deleted: u64,
}

/// ExternalGroupManager - external policy groups and their rules.
pub struct ExternalGroupManager {
    config: PolicyGroupConfig,
    client: Arc<dyn RemoteControllerClient>,
    store: Arc<dyn LocalMappingStore>,
    mapper: RuleMapper,
    allocator: PriorityAllocator,
    stats: ExternalGroupStats,
}

impl std::fmt::Debug for ExternalGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalGroupManager")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ExternalGroupManager {
    pub fn new(
        config: PolicyGroupConfig,
        client: Arc<dyn RemoteControllerClient>,
        store: Arc<dyn LocalMappingStore>,
    ) -> Self {
        let mapper = RuleMapper::new(config.flow_logging_enabled, config.stats_collection_enabled);
        let allocator = PriorityAllocator::new(config.priority);
        Self {
            config,
            client,
            store,
            mapper,
            allocator,
            stats: ExternalGroupStats::default(),
        }
    }

    pub fn config(&self) -> &PolicyGroupConfig {
        &self.config
    }

    pub fn stats(&self) -> &ExternalGroupStats {
        &self.stats
    }

    fn external_filter() -> NuageFilter {
        NuageFilter::eq("external", true)
    }

    fn l2domain_of_subnet(&self, subnet_id: &str) -> OrchResult<Option<ParentDomain>> {
        Ok(self
            .store
            .subnet_mapping(subnet_id)?
            .filter(|m| m.is_l2domain())
            .map(|m| ParentDomain::l2domain(m.nuage_subnet_id)))
    }

    fn domain_of_router(&self, router_id: &str) -> OrchResult<Option<ParentDomain>> {
        Ok(self.store.router_domain(router_id)?.map(ParentDomain::domain))
    }

    pub async fn create_group(&mut self, request: &ExternalGroupRequest) -> OrchResult<ExternalGroup> {
        let (parent, owner) = match (&request.subnet_id, &request.router_id) {
            (Some(subnet_id), _) => {
                let parent = self.l2domain_of_subnet(subnet_id)?.ok_or_else(|| {
                    OrchError::validation(format!("VSD L2Domain not found for subnet {}", subnet_id))
                })?;
                (parent, subnet_id)
            }
            (None, Some(router_id)) => {
                let parent = self.domain_of_router(router_id)?.ok_or_else(|| {
                    OrchError::validation(format!("VSD domain not found for router {}", router_id))
                })?;
                (parent, router_id)
            }
            (None, None) => {
                return Err(OrchError::validation("Either router_id or subnet_id must be specified"));
            }
        };

        let body = json!({
            "name": request.name,
            "description": request.description,
            "EVPNCommunityTag": request.extended_community_id,
            "externalID": vsd::external_id(owner, &self.config.cms_id),
            "external": true,
            "type": PolicyGroupKind::Software.vsd_type(),
        });
        let created = vsd::create_one(&*self.client, &parent.child_path(Resource::PolicyGroup), body).await?;
        let group = ExternalGroup::from_object(&created)?;
        self.stats.groups_created += 1;
        info!(group = %group.id, %parent, "external group created");
        audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "ExternalGroupManager", "create_external_group")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&group.id)
            .with_object_type("policygroup")
            .with_details(json!({ "name": group.name, "parent": parent.to_string() })));
        Ok(group)
    }

    pub async fn get_group(&self, id: &str) -> OrchResult<ExternalGroup> {
        let filter = Self::external_filter();
        let object = vsd::fetch(&*self.client, &Resource::PolicyGroup.object_path(id), Some(&filter))
            .await?
            .ok_or_else(|| OrchError::not_found(EXTERNAL_GROUP, id))?;
        ExternalGroup::from_object(&object)
    }

    pub async fn list_groups(&self, query: &ExternalGroupQuery) -> OrchResult<Vec<ExternalGroup>> {
        let external = Self::external_filter();
        let objects = match query {
            ExternalGroupQuery::Id(id) => return Ok(vec![self.get_group(id).await?]),
            ExternalGroupQuery::All => {
                vsd::fetch_all(&*self.client, &Resource::PolicyGroup.collection_path(), Some(&external)).await?
            }
            ExternalGroupQuery::Name(name) => {
                let filter = NuageFilter::eq("name", name).and("external", true);
                vsd::fetch_all(&*self.client, &Resource::PolicyGroup.collection_path(), Some(&filter)).await?
            }
            ExternalGroupQuery::Subnet(subnet_id) => {
                let parent = self.l2domain_of_subnet(subnet_id)?.ok_or_else(|| {
                    OrchError::validation(format!("Subnet {} doesn't have mapping l2domain on VSD", subnet_id))
                })?;
                vsd::fetch_all(&*self.client, &parent.child_path(Resource::PolicyGroup), Some(&external)).await?
            }
            ExternalGroupQuery::Router(router_id) => {
                let parent = self.domain_of_router(router_id)?.ok_or_else(|| {
                    OrchError::validation(format!("VSD domain not found for router {}", router_id))
                })?;
                vsd::fetch_all(&*self.client, &parent.child_path(Resource::PolicyGroup), Some(&external)).await?
            }
        };
        objects.iter().map(ExternalGroup::from_object).collect()
    }

    pub async fn delete_group(&mut self, id: &str) -> OrchResult<()> {
        let group = self.get_group(id).await?;
        self.client.delete(&Resource::PolicyGroup.object_path(&group.id)).await?;
        self.stats.groups_deleted += 1;
        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "ExternalGroupManager", "delete_external_group")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(id)
            .with_object_type("policygroup"));
        Ok(())
    }

    pub async fn create_rule(&mut self, request: &ExternalRuleRequest) -> OrchResult<ExternalRule> {
        let mut rule = SecurityRule::new("", &request.origin_group_id, request.direction)
            .with_ports(request.port_range_min, request.port_range_max);
        if let Some(ethertype) = &request.ethertype {
            rule.ethertype = ethertype.clone();
        }
        rule.protocol = request.protocol.clone();
        let matched = rule.normalize()?;

        let group = self.get_group(&request.external_group_id).await?;
        let ctx = ParentContext::resolve(&*self.client, &group.parent).await?;
        let acl = AclDirection::same_as(request.direction);
        let template = acl_template(&ctx, acl)?;

        let origin = match create_group(
            &*self.client,
            &self.config.cms_id,
            &group.parent,
            &request.origin_group_id,
            &request.origin_group_id,
            &request.origin_group_id,
            PolicyGroupKind::Software,
        )
        .await?
        {
            Creation::Created(id) | Creation::Found(id) => id,
            Creation::Conflict(e) => return Err(e.into()),
        };

        let target = MappingTarget {
            location_id: origin,
            kind: PolicyGroupKind::Software,
            stateful: true,
            dhcp_managed: ctx.dhcp_managed,
        };
        let mut entry = self
            .mapper
            .map(&matched, &target, &ResolvedRemote::External(group.id.clone()));
        entry.external_id = group.external_id.clone();

        let created = self
            .allocator
            .create_entry(&*self.client, &acl.entries_path(template), &entry)
            .await?;
        let rule = self.rule_from_object(&created, request.direction).await?;
        self.stats.rules_created += 1;
        audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "ExternalGroupManager", "create_external_rule")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&rule.id)
            .with_object_type(acl.entry_resource().entity_name())
            .with_details(json!({ "external_group": group.id, "direction": request.direction })));
        Ok(rule)
    }

    async fn group_name(&self, id: Option<&str>) -> OrchResult<Option<String>> {
        let Some(id) = id else {
            return Ok(None);
        };
        Ok(vsd::fetch(&*self.client, &Resource::PolicyGroup.object_path(id), None)
            .await?
            .and_then(|pg| pg.name().map(str::to_string)))
    }

    async fn rule_from_object(&self, object: &VsdObject, direction: Direction) -> OrchResult<ExternalRule> {
        let protocol = match object.get("protocol") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| OrchError::Internal(format!("unreadable protocol: {}", e)))?,
            None => Protocol::Any,
        };
        let (port_range_min, port_range_max) = split_port_range(object.str("destinationPort"));
        let remote = match object.str("networkType") {
            Some("POLICYGROUP") => object.str("networkID"),
            _ => None,
        };
        Ok(ExternalRule {
            id: object.require_id()?,
            direction,
            protocol,
            port_range_min,
            port_range_max,
            origin_group_id: self.group_name(object.str("locationID")).await?,
            remote_group_id: self.group_name(remote).await?,
        })
    }

    /// Looks a rule up in the ingress entries first, then the egress ones.
    async fn find_rule(&self, id: &str) -> OrchResult<Option<(VsdObject, AclDirection)>> {
        for acl in [AclDirection::Ingress, AclDirection::Egress] {
            if let Some(found) = vsd::fetch(&*self.client, &acl.entry_resource().object_path(id), None).await? {
                return Ok(Some((found, acl)));
            }
        }
        Ok(None)
    }

    pub async fn get_rule(&self, id: &str) -> OrchResult<ExternalRule> {
        let (object, acl) = self
            .find_rule(id)
            .await?
            .ok_or_else(|| OrchError::not_found(EXTERNAL_RULE, id))?;
        self.rule_from_object(&object, direction_of(acl)).await
    }

    /// Rules whose remote side is the external group `group_id`.
    pub async fn list_rules(&self, group_id: &str) -> OrchResult<Vec<ExternalRule>> {
        let group = self.get_group(group_id).await?;
        let ctx = ParentContext::resolve(&*self.client, &group.parent).await?;
        let filter = NuageFilter::eq("networkID", &group.id);
        let mut rules = Vec::new();
        for acl in [AclDirection::Ingress, AclDirection::Egress] {
            let Ok(template) = acl_template(&ctx, acl) else {
                continue;
            };
            for object in vsd::fetch_all(&*self.client, &acl.entries_path(template), Some(&filter)).await? {
                rules.push(self.rule_from_object(&object, direction_of(acl)).await?);
            }
        }
        Ok(rules)
    }

    pub async fn delete_rule(&mut self, id: &str) -> OrchResult<()> {
        let (_, acl) = self
            .find_rule(id)
            .await?
            .ok_or_else(|| OrchError::not_found(EXTERNAL_RULE, id))?;
        self.client.delete(&acl.entry_resource().object_path(id)).await?;
        self.stats.rules_deleted += 1;
        audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "ExternalGroupManager", "delete_external_rule")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(id)
            .with_object_type(acl.entry_resource().entity_name()));
        Ok(())
    }
}

fn direction_of(acl: AclDirection) -> Direction {
    match acl {
        AclDirection::Ingress => Direction::Ingress,
        AclDirection::Egress => Direction::Egress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, SubnetMapping, VsdSubnetKind};
    use nuage_orch_test::{seed_enterprise, seed_l2domain, seed_l3, FakeVsd, L2DomainOptions, CMS_ID};
    use nuage_types::IpVersion;
    use nuage_vsd::IgnoreErrors;
    use pretty_assertions::assert_eq;

    struct Harness {
        vsd: Arc<IgnoreErrors<FakeVsd>>,
        store: Arc<InMemoryStore>,
        manager: ExternalGroupManager,
    }

    fn harness() -> Harness {
        let vsd = Arc::new(IgnoreErrors::new(FakeVsd::new()));
        let store = Arc::new(InMemoryStore::new());
        let config = PolicyGroupConfig {
            cms_id: CMS_ID.to_string(),
            ..Default::default()
        };
        let manager = ExternalGroupManager::new(config, vsd.clone(), store.clone());
        Harness { vsd, store, manager }
    }

    fn l2_mapping(subnet_id: &str, l2domain: &str) -> SubnetMapping {
        SubnetMapping {
            subnet_id: subnet_id.to_string(),
            network_id: "net-1".to_string(),
            nuage_subnet_id: l2domain.to_string(),
            nuage_l2dom_tmplt_id: None,
            net_partition_id: "np-1".to_string(),
            ip_version: IpVersion::V4,
            vsd_managed: false,
            kind: VsdSubnetKind::L2Domain,
            nuage_group_id: None,
            nuage_permission_id: None,
            tenant_id: "tenant".to_string(),
        }
    }

    fn request(subnet_id: Option<&str>, router_id: Option<&str>) -> ExternalGroupRequest {
        ExternalGroupRequest {
            name: "branch-office".to_string(),
            description: Some("remote site".to_string()),
            extended_community_id: Some("63000:1".to_string()),
            subnet_id: subnet_id.map(str::to_string),
            router_id: router_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_create_requires_an_owner() {
        let mut h = harness();
        let err = h.manager.create_group(&request(None, None)).await.unwrap_err();
        assert_eq!(err.to_string(), "Bad request: Either router_id or subnet_id must be specified");

        let err = h.manager.create_group(&request(Some("s-1"), None)).await.unwrap_err();
        assert_eq!(err.to_string(), "Bad request: VSD L2Domain not found for subnet s-1");

        let err = h.manager.create_group(&request(None, Some("r-1"))).await.unwrap_err();
        assert_eq!(err.to_string(), "Bad request: VSD domain not found for router r-1");
    }

    #[tokio::test]
    async fn test_group_lifecycle_on_l2domain() {
        let mut h = harness();
        let ent = seed_enterprise(h.vsd.inner(), "acme");
        let l2 = seed_l2domain(h.vsd.inner(), &ent, L2DomainOptions::default());
        h.store.add_mapping(l2_mapping("s-1", &l2.l2domain)).unwrap();

        let group = h.manager.create_group(&request(Some("s-1"), None)).await.unwrap();
        assert_eq!(group.parent, ParentDomain::l2domain(&l2.l2domain));
        assert_eq!(group.external_id.as_deref(), Some("s-1@cms-test"));
        assert_eq!(group.extended_community_id.as_deref(), Some("63000:1"));

        // A regular policy group in the same parent is not listed.
        h.vsd.inner().insert(
            Resource::PolicyGroup,
            Some((Resource::L2Domain, l2.l2domain.as_str())),
            serde_json::json!({"name": "sg-1", "external": false}),
        );
        let listed = h
            .manager
            .list_groups(&ExternalGroupQuery::Subnet("s-1".into()))
            .await
            .unwrap();
        assert_eq!(listed, vec![group.clone()]);
        assert_eq!(
            h.manager
                .list_groups(&ExternalGroupQuery::Name("branch-office".into()))
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(h.manager.list_groups(&ExternalGroupQuery::All).await.unwrap().len(), 1);

        h.manager.delete_group(&group.id).await.unwrap();
        assert!(matches!(
            h.manager.get_group(&group.id).await,
            Err(OrchError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_regular_group_is_not_external() {
        let h = harness();
        let ent = seed_enterprise(h.vsd.inner(), "acme");
        let l3 = seed_l3(h.vsd.inner(), &ent, true);
        let pg = h.vsd.inner().insert(
            Resource::PolicyGroup,
            Some((Resource::Domain, l3.domain.as_str())),
            serde_json::json!({"name": "sg-1"}),
        );
        assert!(h.manager.get_group(&pg).await.is_err());
    }

    #[tokio::test]
    async fn test_rules_follow_their_direction() {
        let mut h = harness();
        let ent = seed_enterprise(h.vsd.inner(), "acme");
        let l3 = seed_l3(h.vsd.inner(), &ent, true);
        h.store.set_router_domain("router-1", &l3.domain);
        let group = h.manager.create_group(&request(None, Some("router-1"))).await.unwrap();

        let rule = h
            .manager
            .create_rule(&ExternalRuleRequest {
                external_group_id: group.id.clone(),
                direction: Direction::Ingress,
                origin_group_id: "sg-web".to_string(),
                ethertype: None,
                protocol: Some("tcp".into()),
                port_range_min: Some(443),
                port_range_max: Some(444),
            })
            .await
            .unwrap();

        let ingress = h
            .vsd
            .inner()
            .children(l3.ingress_acl.as_deref().unwrap(), Resource::IngressAclEntry);
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].str("networkID"), Some(group.id.as_str()));
        assert_eq!(ingress[0].external_id(), Some("router-1@cms-test"));
        assert_eq!(rule.direction, Direction::Ingress);
        assert_eq!(rule.protocol, Protocol::Number(6));
        assert_eq!(rule.port_range_min.as_deref(), Some("443"));
        assert_eq!(rule.port_range_max.as_deref(), Some("444"));
        assert_eq!(rule.origin_group_id.as_deref(), Some("sg-web"));
        assert_eq!(rule.remote_group_id.as_deref(), Some("branch-office"));

        assert_eq!(h.manager.get_rule(&rule.id).await.unwrap(), rule);
        assert_eq!(h.manager.list_rules(&group.id).await.unwrap(), vec![rule.clone()]);

        h.manager.delete_rule(&rule.id).await.unwrap();
        assert!(h.manager.get_rule(&rule.id).await.is_err());
        assert_eq!(h.manager.stats().rules_deleted, 1);
    }

    #[test]
    fn test_split_port_range() {
        assert_eq!(split_port_range(Some("*")), (None, None));
        assert_eq!(split_port_range(None), (None, None));
        assert_eq!(split_port_range(Some("22")), (Some("22".into()), Some("22".into())));
        assert_eq!(split_port_range(Some("80-90")), (Some("80".into()), Some("90".into())));
    }
}
