//! Redirect targets and advanced forwarding rules.
//!
//! A redirect target is a service insertion point owned by an L2 domain or
//! an L3 domain. Vports are bound to it, it may carry a virtual IP, and
//! ingress advanced forwarding entries steer matching traffic to it.

use std::sync::Arc;

use super::mapper::port_range;
use super::policy_group::{create_group, PolicyGroupConfig};
use super::priority::PriorityAllocator;
use super::types::{Direction, NetworkType, PolicyGroupKind, Protocol, ProtocolSpec, RemoteSpec, RuleMatch, SecurityRule};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::error::{OrchError, OrchResult};
use crate::rollback::{rollback, CompensatingAction, Ledger, VsdCompensator};
use crate::store::LocalMappingStore;
use crate::vsd::{self, Creation, ParentContext, ParentDomain, ParentKind};
use nuage_types::IpPrefix;
use nuage_vsd::{RemoteControllerClient, Resource, VsdObject};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

const REDIRECT_TARGET: &str = "nuage-redirect-target";
const REDIRECT_RULE: &str = "nuage-redirect-target-rule";

/// `endPointType` of a redirect target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsertionMode {
    #[default]
    L3,
    VirtualWire,
    #[serde(rename = "NSG_VNF")]
    NsgVnf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTargetRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub insertion_mode: InsertionMode,
    #[serde(default)]
    pub redundancy_enabled: bool,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub router_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTarget {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub insertion_mode: InsertionMode,
    pub redundancy_enabled: bool,
    pub parent: ParentDomain,
    pub external_id: Option<String>,
    /// Tag referenced by forwarding entries; the VSD assigns it.
    pub virtual_network_id: Option<String>,
}

impl RedirectTarget {
    fn from_object(object: &VsdObject) -> OrchResult<Self> {
        let id = object.require_id()?;
        let parent = ParentDomain::of(object)
            .ok_or_else(|| OrchError::Internal(format!("redirect target {} has no domain", id)))?;
        let insertion_mode = match object.get("endPointType") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| OrchError::Internal(format!("unreadable endPointType: {}", e)))?,
            None => InsertionMode::default(),
        };
        Ok(Self {
            name: object.name().unwrap_or_default().to_string(),
            description: object.str("description").map(str::to_string),
            insertion_mode,
            redundancy_enabled: object.bool("redundancyEnabled").unwrap_or(false),
            external_id: object.external_id().map(str::to_string),
            virtual_network_id: object.str("virtualNetworkID").map(str::to_string),
            parent,
            id,
        })
    }

    /// Value for `redirectVPortTagID`.
    fn vport_tag(&self) -> &str {
        self.virtual_network_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RedirectAction {
    Forward,
    #[default]
    Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRuleRequest {
    pub redirect_target_id: String,
    /// Security group the entry is located on.
    pub origin_group_id: String,
    #[serde(default)]
    pub action: RedirectAction,
    /// Drawn at random when absent.
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub ethertype: Option<String>,
    #[serde(default)]
    pub protocol: Option<ProtocolSpec>,
    #[serde(default)]
    pub port_range_min: Option<u32>,
    #[serde(default)]
    pub port_range_max: Option<u32>,
    #[serde(default)]
    pub remote_ip_prefix: Option<IpPrefix>,
    #[serde(default)]
    pub remote_group_id: Option<String>,
}

/// Body of an ingress advanced forwarding entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdvFwdEntry {
    ether_type: String,
    action: RedirectAction,
    #[serde(rename = "DSCP")]
    dscp: String,
    protocol: Protocol,
    location_type: String,
    #[serde(rename = "locationID")]
    location_id: String,
    network_type: NetworkType,
    #[serde(rename = "networkID", skip_serializing_if = "Option::is_none")]
    network_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reflexive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_port: Option<String>,
    #[serde(rename = "redirectVPortTagID")]
    redirect_vport_tag_id: String,
    flow_logging_enabled: bool,
    stats_logging_enabled: bool,
    #[serde(rename = "externalID", skip_serializing_if = "Option::is_none")]
    external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub id: String,
    pub action: RedirectAction,
    pub priority: Option<u64>,
    pub protocol: Protocol,
    pub ether_type: Option<String>,
    pub destination_port: Option<String>,
    pub redirect_vport_tag_id: Option<String>,
    /// Security group of the entry's location.
    pub origin_group_id: Option<String>,
    /// Security group of the remote side, if any.
    pub remote_group_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RedirectTargetStats {
    pub targets_created: u64,
    pub targets_deleted: u64,
    pub virtual_ips_created: u64,
    pub rules_created: u64,
    pub rules_deleted: u64,
    pub rollbacks: u64,
}

/// RedirectTargetManager - redirect targets, their bindings and rules.
pub struct RedirectTargetManager {
    config: PolicyGroupConfig,
    client: Arc<dyn RemoteControllerClient>,
    store: Arc<dyn LocalMappingStore>,
    allocator: PriorityAllocator,
    stats: RedirectTargetStats,
}

impl std::fmt::Debug for RedirectTargetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectTargetManager")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl RedirectTargetManager {
    pub fn new(
        config: PolicyGroupConfig,
        client: Arc<dyn RemoteControllerClient>,
        store: Arc<dyn LocalMappingStore>,
    ) -> Self {
        let allocator = PriorityAllocator::new(config.priority);
        Self {
            config,
            client,
            store,
            allocator,
            stats: RedirectTargetStats::default(),
        }
    }

    pub fn config(&self) -> &PolicyGroupConfig {
        &self.config
    }

    pub fn stats(&self) -> &RedirectTargetStats {
        &self.stats
    }

    /// Parent of a target owned by a subnet: its L2 domain, or the L3 domain
    /// of a routed subnet.
    async fn parent_of_subnet(&self, subnet_id: &str) -> OrchResult<ParentDomain> {
        let mapping = self.store.subnet_mapping(subnet_id)?.ok_or_else(|| {
            OrchError::validation(format!("Subnet {} doesn't have mapping l2domain on VSD", subnet_id))
        })?;
        if mapping.is_l2domain() {
            Ok(ParentDomain::l2domain(mapping.nuage_subnet_id))
        } else {
            vsd::domain_of_subnet(&*self.client, &mapping.nuage_subnet_id).await
        }
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_target(&mut self, request: &RedirectTargetRequest) -> OrchResult<RedirectTarget> {
        let (parent, owner) = match (&request.subnet_id, &request.router_id) {
            (Some(subnet_id), _) => (self.parent_of_subnet(subnet_id).await?, subnet_id),
            (None, Some(router_id)) => {
                let domain = self.store.router_domain(router_id)?.ok_or_else(|| {
                    OrchError::validation(format!("VSD domain not found for router {}", router_id))
                })?;
                (ParentDomain::domain(domain), router_id)
            }
            (None, None) => {
                return Err(OrchError::validation("Either router_id or subnet_id must be specified"));
            }
        };

        let body = json!({
            "name": request.name,
            "description": request.description,
            "endPointType": request.insertion_mode,
            "redundancyEnabled": request.redundancy_enabled,
            "externalID": vsd::external_id(owner, &self.config.cms_id),
        });
        let created =
            vsd::create_one(&*self.client, &parent.child_path(Resource::RedirectionTarget), body).await?;
        let target = RedirectTarget::from_object(&created)?;
        self.stats.targets_created += 1;
        info!(target = %target.id, %parent, "redirect target created");
        audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "RedirectTargetManager", "create_redirect_target")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&target.id)
            .with_object_type("redirectiontarget")
            .with_details(json!({ "parent": parent.to_string(), "mode": request.insertion_mode })));
        Ok(target)
    }

    pub async fn get_target(&self, id: &str) -> OrchResult<RedirectTarget> {
        let object = vsd::fetch(&*self.client, &Resource::RedirectionTarget.object_path(id), None)
            .await?
            .ok_or_else(|| OrchError::not_found(REDIRECT_TARGET, id))?;
        RedirectTarget::from_object(&object)
    }

    pub async fn list_targets(&self, parent: &ParentDomain) -> OrchResult<Vec<RedirectTarget>> {
        vsd::fetch_all(&*self.client, &parent.child_path(Resource::RedirectionTarget), None)
            .await?
            .iter()
            .map(RedirectTarget::from_object)
            .collect()
    }

    pub async fn delete_target(&mut self, id: &str) -> OrchResult<()> {
        let target = self.get_target(id).await?;
        self.client
            .delete(&Resource::RedirectionTarget.object_path(&target.id))
            .await?;
        self.stats.targets_deleted += 1;
        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "RedirectTargetManager", "delete_redirect_target")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(id)
            .with_object_type("redirectiontarget"));
        Ok(())
    }

    /// Makes `target_id` the only redirect target of the vport.
    pub async fn bind_vport(&mut self, target_id: &str, vport_id: &str) -> OrchResult<()> {
        self.client
            .put(
                &Resource::Vport.child_path(vport_id, Resource::RedirectionTarget),
                json!([target_id]),
            )
            .await?;
        info!(target = %target_id, vport = %vport_id, "vport bound to redirect target");
        Ok(())
    }

    pub async fn unbind_vport(&mut self, vport_id: &str) -> OrchResult<()> {
        self.client
            .put(&Resource::Vport.child_path(vport_id, Resource::RedirectionTarget), json!([]))
            .await?;
        Ok(())
    }

    /// Adds a virtual IP owned by the port `port_id` to a target.
    pub async fn create_virtual_ip(&mut self, target_id: &str, ip: &str, port_id: &str) -> OrchResult<String> {
        let body = json!({
            "virtualIP": ip,
            "externalID": vsd::external_id(port_id, &self.config.cms_id),
        });
        let created = vsd::create_one(
            &*self.client,
            &Resource::RedirectionTarget.child_path(target_id, Resource::VirtualIp),
            body,
        )
        .await?;
        self.stats.virtual_ips_created += 1;
        Ok(created.require_id()?)
    }

    async fn adv_fwd_template(&self, ctx: &ParentContext, target: &RedirectTarget) -> OrchResult<String> {
        let template = vsd::fetch(&*self.client, &ctx.parent.child_path(Resource::IngressAdvFwdTemplate), None)
            .await?
            .map(|t| t.require_id())
            .transpose()?;
        template.ok_or_else(|| match ctx.parent.kind {
            ParentKind::Domain => {
                let router = ctx.external_id.as_deref().map_or(ctx.parent.id.as_str(), vsd::strip_cms_id);
                OrchError::conflict(format!("Router {} does not have policy mapping", router))
            }
            ParentKind::L2Domain => OrchError::conflict(format!(
                "L2Domain of redirect target {} does not have policy mapping",
                target.id
            )),
        })
    }

    /// Policy group of a security group in the parent, created when absent.
    async fn group_in_parent(&self, parent: &ParentDomain, sg_id: &str, ledger: &mut Ledger) -> OrchResult<String> {
        let creation = create_group(
            &*self.client,
            &self.config.cms_id,
            parent,
            sg_id,
            sg_id,
            sg_id,
            PolicyGroupKind::Software,
        )
        .await?;
        match creation {
            Creation::Created(id) => {
                ledger.record(CompensatingAction::delete_remote(Resource::PolicyGroup, &id));
                Ok(id)
            }
            Creation::Found(id) => Ok(id),
            Creation::Conflict(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, request), fields(target = %request.redirect_target_id))]
    pub async fn create_rule(&mut self, request: &RedirectRuleRequest) -> OrchResult<RedirectRule> {
        let mut rule = SecurityRule::new("", &request.origin_group_id, Direction::Ingress)
            .with_ports(request.port_range_min, request.port_range_max);
        if let Some(ethertype) = &request.ethertype {
            rule.ethertype = ethertype.clone();
        }
        rule.protocol = request.protocol.clone();
        rule.remote_ip_prefix = request.remote_ip_prefix.clone();
        rule.remote_group_id = request.remote_group_id.clone();
        let matched = rule.normalize()?;

        let target = self.get_target(&request.redirect_target_id).await?;
        let ctx = ParentContext::resolve(&*self.client, &target.parent).await?;
        let template = self.adv_fwd_template(&ctx, &target).await?;

        let mut ledger = Ledger::new();
        let outcome = self
            .post_rule(&ctx, &target, &template, request, &matched, &mut ledger)
            .await;
        match outcome {
            Ok(created) => {
                ledger.commit();
                self.stats.rules_created += 1;
                audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "RedirectTargetManager", "create_redirect_rule")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(created.id().unwrap_or_default())
                    .with_object_type("ingressadvfwdentrytemplate")
                    .with_details(json!({ "target": target.id })));
                self.rule_from_object(&created).await
            }
            Err(e) => {
                let err = rollback(&mut ledger, &VsdCompensator::remote(&*self.client), e).await;
                self.stats.rollbacks += 1;
                audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "RedirectTargetManager", "create_redirect_rule")
                    .with_outcome(AuditOutcome::Failure)
                    .with_object_id(&target.id)
                    .with_object_type("redirectiontarget")
                    .with_error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn post_rule(
        &self,
        ctx: &ParentContext,
        target: &RedirectTarget,
        template: &str,
        request: &RedirectRuleRequest,
        matched: &RuleMatch,
        ledger: &mut Ledger,
    ) -> OrchResult<VsdObject> {
        let location_id = self.group_in_parent(&ctx.parent, &request.origin_group_id, ledger).await?;
        let (network_type, network_id) = match &matched.remote {
            RemoteSpec::Prefix(prefix) => {
                let id =
                    vsd::ensure_network_macro(&*self.client, &ctx.enterprise_id, prefix, &self.config.cms_id).await?;
                (NetworkType::EnterpriseNetwork, Some(id))
            }
            RemoteSpec::Group(sg_id) => {
                let id = self.group_in_parent(&ctx.parent, sg_id, ledger).await?;
                (NetworkType::PolicyGroup, Some(id))
            }
            RemoteSpec::Unset => {
                let any = matched.any_prefix();
                let id = vsd::ensure_network_macro(&*self.client, &ctx.enterprise_id, &any, &self.config.cms_id).await?;
                (NetworkType::EnterpriseNetwork, Some(id))
            }
        };

        let ports = matched.protocol.is_tcp_or_udp();
        let entry = AdvFwdEntry {
            ether_type: matched.ether_type.hex().to_string(),
            action: request.action,
            dscp: "*".to_string(),
            protocol: matched.protocol,
            location_type: "POLICYGROUP".to_string(),
            location_id,
            network_type,
            network_id,
            reflexive: ports.then_some(true),
            source_port: ports.then(|| "*".to_string()),
            destination_port: ports.then(|| {
                port_range(matched.port_range_min, matched.port_range_max).unwrap_or_else(|| "*".to_string())
            }),
            redirect_vport_tag_id: target.vport_tag().to_string(),
            flow_logging_enabled: self.config.flow_logging_enabled,
            stats_logging_enabled: self.config.stats_collection_enabled,
            external_id: target.external_id.clone(),
        };
        let path = Resource::IngressAdvFwdTemplate.child_path(template, Resource::IngressAdvFwdEntry);
        let created = match request.priority {
            Some(priority) => {
                let body = VsdObject::from_serialize(&entry)?.with("priority", priority).into_value();
                vsd::create_one(&*self.client, &path, body).await?
            }
            None => self.allocator.create_entry(&*self.client, &path, &entry).await?,
        };
        ledger.record(CompensatingAction::delete_remote(
            Resource::IngressAdvFwdEntry,
            created.require_id()?,
        ));
        Ok(created)
    }

    async fn security_group_of(&self, pg_id: Option<&str>) -> OrchResult<Option<String>> {
        let Some(pg_id) = pg_id else {
            return Ok(None);
        };
        Ok(vsd::fetch(&*self.client, &Resource::PolicyGroup.object_path(pg_id), None)
            .await?
            .and_then(|pg| pg.external_id().map(|x| vsd::strip_cms_id(x).to_string())))
    }

    async fn rule_from_object(&self, object: &VsdObject) -> OrchResult<RedirectRule> {
        let protocol = match object.get("protocol") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| OrchError::Internal(format!("unreadable protocol: {}", e)))?,
            None => Protocol::Any,
        };
        let action = match object.get("action") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| OrchError::Internal(format!("unreadable action: {}", e)))?,
            None => RedirectAction::default(),
        };
        let remote = match object.str("networkType") {
            Some("POLICYGROUP") => object.str("networkID"),
            _ => None,
        };
        Ok(RedirectRule {
            id: object.require_id()?,
            action,
            priority: object.get("priority").and_then(|p| p.as_u64()),
            protocol,
            ether_type: object.str("etherType").map(str::to_string),
            destination_port: object.str("destinationPort").map(str::to_string),
            redirect_vport_tag_id: object.str("redirectVPortTagID").map(str::to_string),
            origin_group_id: self.security_group_of(object.str("locationID")).await?,
            remote_group_id: self.security_group_of(remote).await?,
        })
    }

    pub async fn get_rule(&self, id: &str) -> OrchResult<RedirectRule> {
        let object = vsd::fetch(&*self.client, &Resource::IngressAdvFwdEntry.object_path(id), None)
            .await?
            .ok_or_else(|| OrchError::not_found(REDIRECT_RULE, id))?;
        self.rule_from_object(&object).await
    }

    pub async fn delete_rule(&mut self, id: &str) -> OrchResult<()> {
        self.client
            .delete(&Resource::IngressAdvFwdEntry.object_path(id))
            .await?;
        self.stats.rules_deleted += 1;
        audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "RedirectTargetManager", "delete_redirect_rule")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(id)
            .with_object_type("ingressadvfwdentrytemplate"));
        Ok(())
    }
}
