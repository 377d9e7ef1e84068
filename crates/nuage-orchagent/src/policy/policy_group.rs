//! PolicyGroupManager implementation.
//!
//! Materializes security groups as VSD policy groups inside a domain or L2
//! domain, populates them with ACL entries and cleans them up once no vport
//! references them.

use std::sync::Arc;

use super::mapper::{MappingTarget, ResolvedRemote, RuleMapper};
use super::priority::PriorityAllocator;
use super::stateful::needs_reverse;
use super::types::{
    AclDirection, AclEntry, EtherType, PolicyGroupKind, RemoteSpec, RuleMatch, SecurityGroup, SecurityRule,
    ALLOW_ALL_POLICY_GROUP,
};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::config::PriorityConfig;
use crate::error::{OrchError, OrchResult};
use crate::rollback::{rollback, CompensatingAction, Ledger, VsdCompensator};
use crate::store::LocalMappingStore;
use crate::vsd::{self, Creation, ParentContext, ParentDomain};
use nuage_vsd::{NuageFilter, RemoteControllerClient, Resource, VsdErrorCode, VsdObject};
use serde_json::json;
use tracing::{debug, info, warn};

/// Priority of the per-parent egress template holding hardware deny rules.
const HARDWARE_TEMPLATE_PRIORITY: u32 = 1;

/// Configuration for PolicyGroupManager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyGroupConfig {
    /// Suffix of every external id.
    pub cms_id: String,
    pub flow_logging_enabled: bool,
    pub stats_collection_enabled: bool,
    pub priority: PriorityConfig,
}

impl Default for PolicyGroupConfig {
    fn default() -> Self {
        Self {
            cms_id: "openstack".to_string(),
            flow_logging_enabled: false,
            stats_collection_enabled: false,
            priority: PriorityConfig::default(),
        }
    }
}

/// Statistics for PolicyGroupManager operations.
#[derive(Debug, Clone, Default)]
pub struct PolicyGroupStats {
    /// Policy groups created by this manager.
    pub groups_created: u64,
    /// Ensure calls answered by an existing policy group.
    pub groups_reused: u64,
    pub groups_deleted: u64,
    /// ACL entries created, reverse entries included.
    pub entries_created: u64,
    pub entries_deleted: u64,
    /// Multi-step operations that were unwound.
    pub rollbacks: u64,
}

/// The ACL template of `ctx` in direction `acl`.
pub(crate) fn acl_template(ctx: &ParentContext, acl: AclDirection) -> OrchResult<&str> {
    match acl {
        AclDirection::Ingress => ctx.ingress_acl.as_deref(),
        AclDirection::Egress => ctx.egress_acl.as_deref(),
    }
    .ok_or_else(|| vsd::missing_acl_mapping(&ctx.parent))
}

/// Posts an empty policy group for `sg_id` into `parent`. A collision on
/// the external id is resolved by reading the existing group back.
pub(crate) async fn create_group<C>(
    client: &C,
    cms_id: &str,
    parent: &ParentDomain,
    sg_id: &str,
    name: &str,
    description: &str,
    kind: PolicyGroupKind,
) -> OrchResult<Creation<String>>
where
    C: RemoteControllerClient + ?Sized,
{
    let external_id = kind.external_id(sg_id, cms_id);
    let body = json!({
        "name": name,
        "description": description,
        "externalID": external_id,
        "type": kind.vsd_type(),
    });
    let path = parent.child_path(Resource::PolicyGroup);
    match vsd::post_classified(client, &path, body, &VsdErrorCode::PolicyGroupExists).await? {
        Creation::Created(pg) => Ok(Creation::Created(pg.require_id()?)),
        Creation::Found(pg) => Ok(Creation::Found(pg.require_id()?)),
        Creation::Conflict(e) => {
            let filter = NuageFilter::eq("externalID", &external_id);
            match vsd::fetch(client, &path, Some(&filter)).await? {
                Some(existing) => {
                    let id = existing.require_id()?;
                    debug!(sg = %sg_id, pg = %id, "policy group created concurrently");
                    Ok(Creation::Found(id))
                }
                None => Err(e.into()),
            }
        }
    }
}

/// PolicyGroupManager - security groups as VSD policy groups.
pub struct PolicyGroupManager {
    config: PolicyGroupConfig,
    client: Arc<dyn RemoteControllerClient>,
    store: Arc<dyn LocalMappingStore>,
    mapper: RuleMapper,
    allocator: PriorityAllocator,
    stats: PolicyGroupStats,
}

impl std::fmt::Debug for PolicyGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyGroupManager")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl PolicyGroupManager {
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
            stats: PolicyGroupStats::default(),
        }
    }

    pub fn config(&self) -> &PolicyGroupConfig {
        &self.config
    }

    pub fn stats(&self) -> &PolicyGroupStats {
        &self.stats
    }

    pub fn mapper(&self) -> &RuleMapper {
        &self.mapper
    }

    fn group_filter(&self, sg_id: &str, kind: PolicyGroupKind) -> NuageFilter {
        NuageFilter::eq("externalID", kind.external_id(sg_id, &self.config.cms_id))
    }

    /// Returns the policy group of `sg_id` in `parent`, if any.
    pub async fn find(&self, sg_id: &str, parent: &ParentDomain, kind: PolicyGroupKind) -> OrchResult<Option<String>> {
        let filter = self.group_filter(sg_id, kind);
        let found = vsd::fetch(&*self.client, &parent.child_path(Resource::PolicyGroup), Some(&filter)).await?;
        Ok(found.map(|pg| pg.require_id()).transpose()?)
    }

    /// Every policy group of `sg_id`, across all parents.
    pub async fn policy_groups_of(&self, sg_id: &str, kind: PolicyGroupKind) -> OrchResult<Vec<VsdObject>> {
        let filter = self.group_filter(sg_id, kind);
        vsd::fetch_all(&*self.client, &Resource::PolicyGroup.collection_path(), Some(&filter)).await
    }

    /// Returns the policy group of `group` in `parent`, creating and
    /// populating it when absent.
    ///
    /// Rules with an unsupported ethertype are skipped; any other invalid
    /// rule fails the call before the VSD is touched. A group created
    /// concurrently by another writer is returned as is.
    pub async fn ensure(
        &mut self,
        group: &SecurityGroup,
        rules: &[SecurityRule],
        parent: &ParentDomain,
        kind: PolicyGroupKind,
    ) -> OrchResult<String> {
        let mut matches = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.ether_type().is_err() {
                debug!(rule = %rule.id, ethertype = %rule.ethertype, "skipping rule with unsupported ethertype");
                continue;
            }
            matches.push((rule.id.clone(), rule.normalize()?));
        }

        if let Some(existing) = self.find(&group.id, parent, kind).await? {
            self.stats.groups_reused += 1;
            return Ok(existing);
        }

        let ctx = ParentContext::resolve(&*self.client, parent).await?;
        if !matches.is_empty() || kind.is_hardware() {
            ctx.require_acl_mapping()?;
        }

        let pg_id = match self
            .create_group(parent, &group.id, &group.id, &group.name, kind)
            .await?
        {
            Creation::Created(id) => id,
            Creation::Found(id) => {
                self.stats.groups_reused += 1;
                return Ok(id);
            }
            Creation::Conflict(e) => return Err(e.into()),
        };

        let mut ledger = Ledger::new();
        ledger.record(CompensatingAction::delete_remote(Resource::PolicyGroup, &pg_id));
        let outcome = self
            .populate(&ctx, &pg_id, &group.id, &matches, kind, &mut ledger)
            .await;
        match outcome {
            Ok(entries) => {
                ledger.commit();
                self.stats.groups_created += 1;
                self.stats.entries_created += entries;
                info!(sg = %group.id, pg = %pg_id, %parent, entries, "policy group created");
                audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "PolicyGroupManager", "create_policy_group")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(&pg_id)
                    .with_object_type("policygroup")
                    .with_details(json!({
                        "security_group": group.id,
                        "parent": parent.to_string(),
                        "type": kind.vsd_type(),
                        "entries": entries,
                    })));
                Ok(pg_id)
            }
            Err(e) => {
                let err = rollback(&mut ledger, &VsdCompensator::remote(&*self.client), e).await;
                self.stats.rollbacks += 1;
                audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, "PolicyGroupManager", "create_policy_group")
                    .with_outcome(AuditOutcome::Failure)
                    .with_object_id(&group.id)
                    .with_object_type("security_group")
                    .with_error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn populate(
        &self,
        ctx: &ParentContext,
        pg_id: &str,
        sg_id: &str,
        rules: &[(String, RuleMatch)],
        kind: PolicyGroupKind,
        ledger: &mut Ledger,
    ) -> OrchResult<u64> {
        let mut created = 0;
        for (rule_id, rule) in rules {
            created += self
                .create_rule_entries(ctx, pg_id, sg_id, rule_id, rule, kind, ledger)
                .await?;
        }
        if kind.is_hardware() {
            self.close_hardware_group(ctx, pg_id, ledger).await?;
            created += 1;
        }
        Ok(created)
    }

    async fn create_group(
        &self,
        parent: &ParentDomain,
        sg_id: &str,
        name: &str,
        description: &str,
        kind: PolicyGroupKind,
    ) -> OrchResult<Creation<String>> {
        create_group(&*self.client, &self.config.cms_id, parent, sg_id, name, description, kind).await
    }

    /// Creates the entries of one rule, plus the reverse entry when the VSD
    /// cannot track it. Returns the number of entries created.
    #[allow(clippy::too_many_arguments)]
    async fn create_rule_entries(
        &self,
        ctx: &ParentContext,
        pg_id: &str,
        sg_id: &str,
        rule_id: &str,
        rule: &RuleMatch,
        kind: PolicyGroupKind,
        ledger: &mut Ledger,
    ) -> OrchResult<u64> {
        let hardware = kind.is_hardware();
        let mut rule = rule.clone();
        match rule.remote {
            RemoteSpec::Unset => rule.remote = RemoteSpec::Prefix(rule.any_prefix()),
            RemoteSpec::Group(_) if hardware => rule.remote = RemoteSpec::Prefix(rule.any_prefix()),
            _ => {}
        }
        let remote = self.resolve_remote(ctx, &rule.remote, kind, ledger).await?;
        let stateful = !hardware && self.store.sg_stateful(sg_id)?;
        let target = MappingTarget {
            location_id: pg_id.to_string(),
            kind,
            stateful,
            dhcp_managed: ctx.dhcp_managed,
        };
        let external_id = kind.external_id(rule_id, &self.config.cms_id);

        let mut directions = vec![rule.clone()];
        if needs_reverse(&rule, stateful) {
            directions.push(rule.reversed());
        }
        let mut created = 0;
        for matched in &directions {
            let entry = self
                .mapper
                .map(matched, &target, &remote)
                .with_external_id(external_id.clone());
            self.post_entry(ctx, matched.direction.acl_direction(), &entry, ledger)
                .await?;
            created += 1;
        }
        Ok(created)
    }

    async fn resolve_remote(
        &self,
        ctx: &ParentContext,
        remote: &RemoteSpec,
        kind: PolicyGroupKind,
        ledger: &mut Ledger,
    ) -> OrchResult<ResolvedRemote> {
        match remote {
            RemoteSpec::Unset => Ok(ResolvedRemote::None),
            RemoteSpec::Prefix(prefix) => {
                let id =
                    vsd::ensure_network_macro(&*self.client, &ctx.enterprise_id, prefix, &self.config.cms_id).await?;
                Ok(ResolvedRemote::Macro(id))
            }
            RemoteSpec::Group(sg_id) => {
                let id = match self.create_group(&ctx.parent, sg_id, sg_id, sg_id, kind).await? {
                    Creation::Created(id) => {
                        ledger.record(CompensatingAction::delete_remote(Resource::PolicyGroup, &id));
                        id
                    }
                    Creation::Found(id) => id,
                    Creation::Conflict(e) => return Err(e.into()),
                };
                Ok(ResolvedRemote::PolicyGroup(id))
            }
        }
    }

    async fn post_entry(
        &self,
        ctx: &ParentContext,
        acl: AclDirection,
        entry: &AclEntry,
        ledger: &mut Ledger,
    ) -> OrchResult<String> {
        let template = acl_template(ctx, acl)?;
        let created = self
            .allocator
            .create_entry(&*self.client, &acl.entries_path(template), entry)
            .await?;
        let id = created.require_id()?;
        ledger.record(CompensatingAction::delete_remote(acl.entry_resource(), &id));
        Ok(id)
    }

    /// Adds the explicit deny entry a hardware group needs, in the parent's
    /// dedicated hardware egress template.
    async fn close_hardware_group(&self, ctx: &ParentContext, pg_id: &str, ledger: &mut Ledger) -> OrchResult<String> {
        let template = self.hardware_template(ctx).await?;
        let created = self
            .allocator
            .create_entry(
                &*self.client,
                &AclDirection::Egress.entries_path(&template),
                &AclEntry::deny_all(pg_id),
            )
            .await?;
        let id = created.require_id()?;
        ledger.record(CompensatingAction::delete_remote(Resource::EgressAclEntry, &id));
        Ok(id)
    }

    /// The parent's hardware egress template. Shared by every hardware group
    /// of the parent, so it is never rolled back.
    async fn hardware_template(&self, ctx: &ParentContext) -> OrchResult<String> {
        let path = ctx.parent.child_path(Resource::EgressAclTemplate);
        let external_id = match &ctx.external_id {
            Some(parent_external_id) => format!("hw:{}", parent_external_id),
            None => vsd::external_id(&format!("hw:{}", ctx.parent.id), &self.config.cms_id),
        };
        let body = json!({
            "name": format!("hw:{}", ctx.parent.id),
            "active": true,
            "priority": HARDWARE_TEMPLATE_PRIORITY,
            "externalID": external_id,
        });
        match vsd::post_classified(&*self.client, &path, body, &VsdErrorCode::DuplicateAclPriority).await? {
            Creation::Created(template) | Creation::Found(template) => Ok(template.require_id()?),
            Creation::Conflict(e) => {
                let filter = NuageFilter::eq("priority", HARDWARE_TEMPLATE_PRIORITY);
                vsd::fetch(&*self.client, &path, Some(&filter))
                    .await?
                    .map(|t| t.require_id())
                    .transpose()?
                    .ok_or(OrchError::Remote(e))
            }
        }
    }

    /// Deletes every policy group of `sg_id`. Groups still attached to a
    /// vport are left in place. Returns the number deleted.
    pub async fn delete(&mut self, sg_id: &str, kind: PolicyGroupKind) -> OrchResult<usize> {
        let groups = self.policy_groups_of(sg_id, kind).await?;
        let deleted = self.delete_groups(&groups).await?;
        self.stats.groups_deleted += deleted as u64;
        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "PolicyGroupManager", "delete_policy_group")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(sg_id)
            .with_object_type("security_group")
            .with_details(json!({ "deleted": deleted, "found": groups.len() })));
        Ok(deleted)
    }

    async fn delete_groups(&self, groups: &[VsdObject]) -> OrchResult<usize> {
        let mut deleted = 0;
        for pg in groups {
            let id = pg.require_id()?;
            match self.client.delete(&Resource::PolicyGroup.object_path(&id)).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_conflict_with(&VsdErrorCode::PolicyGroupInUse) => {
                    debug!(pg = %id, "policy group still in use, keeping it");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    /// Deletes the policy groups of `sg_ids` that no vport references any
    /// more. Returns the number deleted.
    pub async fn check_unused(&mut self, sg_ids: &[String], kind: PolicyGroupKind) -> OrchResult<usize> {
        if sg_ids.is_empty() {
            return Ok(0);
        }
        let filter = NuageFilter::any_of(
            "externalID",
            sg_ids.iter().map(|id| kind.external_id(id, &self.config.cms_id)),
        );
        let groups = vsd::fetch_all(&*self.client, &Resource::PolicyGroup.collection_path(), Some(&filter)).await?;
        let mut unused = Vec::new();
        for pg in groups {
            let id = pg.require_id()?;
            let vports = vsd::fetch_all(&*self.client, &Resource::PolicyGroup.child_path(&id, Resource::Vport), None)
                .await?;
            if vports.is_empty() {
                unused.push(pg);
            }
        }
        let deleted = self.delete_groups(&unused).await?;
        self.stats.groups_deleted += deleted as u64;
        if deleted > 0 {
            info!(deleted, "removed unused policy groups");
        }
        Ok(deleted)
    }

    /// Adds a rule to every policy group of its security group. Returns the
    /// number of entries created.
    pub async fn add_rule(&mut self, rule: &SecurityRule, kind: PolicyGroupKind) -> OrchResult<u64> {
        let matched = rule.normalize()?;
        let groups = self.policy_groups_of(&rule.security_group_id, kind).await?;
        let mut ledger = Ledger::new();
        let outcome = self.add_rule_to_groups(&groups, rule, &matched, kind, &mut ledger).await;
        match outcome {
            Ok(created) => {
                ledger.commit();
                self.stats.entries_created += created;
                audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "PolicyGroupManager", "create_rule")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(&rule.id)
                    .with_object_type("security_group_rule")
                    .with_details(json!({ "groups": groups.len(), "entries": created })));
                Ok(created)
            }
            Err(e) => {
                let err = rollback(&mut ledger, &VsdCompensator::remote(&*self.client), e).await;
                self.stats.rollbacks += 1;
                audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, "PolicyGroupManager", "create_rule")
                    .with_outcome(AuditOutcome::Failure)
                    .with_object_id(&rule.id)
                    .with_error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn add_rule_to_groups(
        &self,
        groups: &[VsdObject],
        rule: &SecurityRule,
        matched: &RuleMatch,
        kind: PolicyGroupKind,
        ledger: &mut Ledger,
    ) -> OrchResult<u64> {
        let mut created = 0;
        for pg in groups {
            let pg_id = pg.require_id()?;
            let parent = ParentDomain::of(pg)
                .ok_or_else(|| OrchError::Internal(format!("policy group {} has no domain", pg_id)))?;
            let ctx = ParentContext::resolve(&*self.client, &parent).await?;
            ctx.require_acl_mapping()?;
            created += self
                .create_rule_entries(&ctx, &pg_id, &rule.security_group_id, &rule.id, matched, kind, ledger)
                .await?;
        }
        Ok(created)
    }

    /// Deletes every entry created for `rule`, reverse entries included.
    pub async fn delete_rule(&mut self, rule: &SecurityRule, kind: PolicyGroupKind) -> OrchResult<usize> {
        if rule.ether_type().is_err() {
            return Ok(0);
        }
        let matched = rule.normalize()?;
        let stateful = !kind.is_hardware() && self.store.sg_stateful(&rule.security_group_id)?;
        let mut directions = vec![matched.direction.acl_direction()];
        if needs_reverse(&matched, stateful) {
            directions.push(matched.direction.opposite().acl_direction());
        }

        let filter = NuageFilter::eq("externalID", kind.external_id(&rule.id, &self.config.cms_id));
        let mut deleted = 0;
        for acl in directions {
            let resource = acl.entry_resource();
            let entries = vsd::fetch_all(&*self.client, &resource.collection_path(), Some(&filter)).await?;
            for entry in entries {
                self.client.delete(&resource.object_path(&entry.require_id()?)).await?;
                deleted += 1;
            }
        }
        self.stats.entries_deleted += deleted as u64;
        audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "PolicyGroupManager", "delete_rule")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&rule.id)
            .with_object_type("security_group_rule")
            .with_details(json!({ "entries": deleted })));
        Ok(deleted)
    }

    /// Returns the allow-all group of `parent`, creating it with forwarding
    /// entries for both address families in both templates when absent.
    pub async fn ensure_allow_all(&mut self, parent: &ParentDomain, kind: PolicyGroupKind) -> OrchResult<String> {
        let name = match kind {
            PolicyGroupKind::Hardware => format!("{}_HARDWARE", ALLOW_ALL_POLICY_GROUP),
            _ => ALLOW_ALL_POLICY_GROUP.to_string(),
        };
        let pg_id = match self
            .create_group(parent, ALLOW_ALL_POLICY_GROUP, &name, &name, kind)
            .await?
        {
            Creation::Created(id) => id,
            Creation::Found(id) => {
                self.stats.groups_reused += 1;
                return Ok(id);
            }
            Creation::Conflict(e) => return Err(e.into()),
        };

        let mut ledger = Ledger::new();
        ledger.record(CompensatingAction::delete_remote(Resource::PolicyGroup, &pg_id));
        let outcome = self.populate_allow_all(parent, &pg_id, &mut ledger).await;
        match outcome {
            Ok(entries) => {
                ledger.commit();
                self.stats.groups_created += 1;
                self.stats.entries_created += entries;
                audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "PolicyGroupManager", "create_allow_all")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(&pg_id)
                    .with_object_type("policygroup")
                    .with_details(json!({ "parent": parent.to_string(), "type": kind.vsd_type() })));
                Ok(pg_id)
            }
            Err(e) => {
                let err = rollback(&mut ledger, &VsdCompensator::remote(&*self.client), e).await;
                self.stats.rollbacks += 1;
                warn!(%parent, error = %err, "allow-all policy group rolled back");
                Err(err)
            }
        }
    }

    async fn populate_allow_all(&self, parent: &ParentDomain, pg_id: &str, ledger: &mut Ledger) -> OrchResult<u64> {
        let ctx = ParentContext::resolve(&*self.client, parent).await?;
        let external_id = vsd::external_id(ALLOW_ALL_POLICY_GROUP, &self.config.cms_id);
        let mut created = 0;
        for ether_type in EtherType::ALL {
            for acl in [AclDirection::Ingress, AclDirection::Egress] {
                let mut entry = AclEntry::allow_any(ether_type, pg_id).with_external_id(external_id.clone());
                entry.flow_logging_enabled = self.config.flow_logging_enabled;
                entry.stats_logging_enabled = self.config.stats_collection_enabled;
                self.post_entry(&ctx, acl, &entry, ledger).await?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Ids of the policy groups attached to a vport.
    pub async fn vport_policy_groups(&self, vport_id: &str) -> OrchResult<Vec<String>> {
        let path = Resource::Vport.child_path(vport_id, Resource::PolicyGroup);
        vsd::fetch_all(&*self.client, &path, None)
            .await?
            .iter()
            .map(|pg| pg.require_id().map_err(OrchError::from))
            .collect()
    }

    /// Replaces the policy groups attached to a vport.
    pub async fn set_vport_policy_groups(&mut self, vport_id: &str, policy_group_ids: &[String]) -> OrchResult<()> {
        self.client
            .put(
                &Resource::Vport.child_path(vport_id, Resource::PolicyGroup),
                json!(policy_group_ids),
            )
            .await?;
        audit_log!(AuditRecord::new(AuditCategory::NetworkConfig, "PolicyGroupManager", "update_vport_policygroups")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(vport_id)
            .with_object_type("vport")
            .with_details(json!({ "policy_groups": policy_group_ids })));
        Ok(())
    }

    /// Attaches the allow-all group of `parent` to a vport, next to the
    /// groups it already has. Returns the allow-all group id.
    pub async fn attach_allow_all(
        &mut self,
        vport_id: &str,
        parent: &ParentDomain,
        kind: PolicyGroupKind,
    ) -> OrchResult<String> {
        let pg_id = self.ensure_allow_all(parent, kind).await?;
        let mut attached = self.vport_policy_groups(vport_id).await?;
        if !attached.contains(&pg_id) {
            attached.push(pg_id.clone());
            self.set_vport_policy_groups(vport_id, &attached).await?;
        }
        Ok(pg_id)
    }

    /// Removes any allow-all group from a vport. Returns whether one was
    /// attached.
    pub async fn detach_allow_all(&mut self, vport_id: &str, kind: PolicyGroupKind) -> OrchResult<bool> {
        let allow_all = kind.external_id(ALLOW_ALL_POLICY_GROUP, &self.config.cms_id);
        let path = Resource::Vport.child_path(vport_id, Resource::PolicyGroup);
        let attached = vsd::fetch_all(&*self.client, &path, None).await?;
        let keep: Vec<String> = attached
            .iter()
            .filter(|pg| pg.external_id() != Some(allow_all.as_str()))
            .filter_map(|pg| pg.id().map(str::to_string))
            .collect();
        if keep.len() == attached.len() {
            return Ok(false);
        }
        self.set_vport_policy_groups(vport_id, &keep).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::Direction;
    use crate::store::InMemoryStore;
    use nuage_orch_test::{seed_enterprise, seed_l2domain, seed_l3, FakeVsd, Fault, L2DomainOptions, CMS_ID};
    use nuage_vsd::{IgnoreErrors, RestError, RestMethod};
    use pretty_assertions::assert_eq;

    struct Harness {
        vsd: Arc<IgnoreErrors<FakeVsd>>,
        store: Arc<InMemoryStore>,
        manager: PolicyGroupManager,
    }

    impl Harness {
        fn new() -> Self {
            let vsd = Arc::new(IgnoreErrors::new(FakeVsd::new()));
            let store = Arc::new(InMemoryStore::new());
            let config = PolicyGroupConfig {
                cms_id: CMS_ID.to_string(),
                ..Default::default()
            };
            let manager = PolicyGroupManager::new(config, vsd.clone(), store.clone());
            Self { vsd, store, manager }
        }

        fn fake(&self) -> &FakeVsd {
            self.vsd.inner()
        }
    }

    fn web_group() -> (SecurityGroup, Vec<SecurityRule>) {
        let group = SecurityGroup {
            id: "sg-web".into(),
            name: "web".into(),
        };
        let rules = vec![
            SecurityRule::new("r-http", "sg-web", Direction::Ingress)
                .with_protocol("tcp")
                .with_ports(Some(80), Some(80)),
            SecurityRule::new("r-out", "sg-web", Direction::Egress),
        ];
        (group, rules)
    }

    #[tokio::test]
    async fn test_ensure_creates_group_and_entries() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let (group, rules) = web_group();

        let pg = h
            .manager
            .ensure(&group, &rules, &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap();

        let stored = h.fake().object(&pg).unwrap();
        assert_eq!(stored.external_id(), Some("sg-web@cms-test"));
        assert_eq!(stored.name(), Some("sg-web"));
        assert_eq!(stored.str("description"), Some("web"));
        // Ingress rules land in the egress template and vice versa.
        let egress = h.fake().children(l3.egress_acl.as_deref().unwrap(), Resource::EgressAclEntry);
        let ingress = h.fake().children(l3.ingress_acl.as_deref().unwrap(), Resource::IngressAclEntry);
        assert_eq!(egress.len(), 1);
        assert_eq!(ingress.len(), 1);
        assert_eq!(egress[0].external_id(), Some("r-http@cms-test"));
        assert_eq!(egress[0].str("destinationPort"), Some("80"));
        assert_eq!(h.manager.stats().entries_created, 2);
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let parent = ParentDomain::domain(&l3.domain);
        let (group, rules) = web_group();

        let first = h.manager.ensure(&group, &rules, &parent, PolicyGroupKind::Software).await.unwrap();
        let mutations = h.fake().mutating_requests();
        let second = h.manager.ensure(&group, &rules, &parent, PolicyGroupKind::Software).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.fake().mutating_requests(), mutations);
        assert_eq!(h.manager.stats().groups_reused, 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_resolves_to_existing() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let winner = h.fake().insert(
            Resource::PolicyGroup,
            Some((Resource::Domain, l3.domain.as_str())),
            json!({"externalID": "sg-web@cms-test"}),
        );
        // The lookup misses, the create collides.
        h.fake()
            .inject(Fault::new(RestMethod::Get, "/policygroups", RestError::not_found("policygroup")));
        let (group, rules) = web_group();

        let pg = h
            .manager
            .ensure(&group, &rules, &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap();
        assert_eq!(pg, winner);
        assert_eq!(h.fake().count(Resource::PolicyGroup), 1);
    }

    #[tokio::test]
    async fn test_invalid_rule_fails_before_remote_calls() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let (group, mut rules) = web_group();
        rules.push(
            SecurityRule::new("r-bad", "sg-web", Direction::Ingress)
                .with_remote_prefix("10.0.0.0/8".parse().unwrap())
                .with_remote_group("sg-db"),
        );
        h.fake().clear_requests();

        let err = h
            .manager
            .ensure(&group, &rules, &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchError::Validation(_)));
        assert!(h.fake().requests().is_empty());
    }

    #[tokio::test]
    async fn test_missing_templates_is_conflict() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, false);
        let (group, rules) = web_group();

        let err = h
            .manager
            .ensure(&group, &rules, &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), format!("Router {} does not have ACL mapping", l3.domain));
        assert_eq!(h.fake().count(Resource::PolicyGroup), 0);
    }

    #[tokio::test]
    async fn test_failed_entry_rolls_back_group() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        h.fake().inject(Fault::new(
            RestMethod::Post,
            "/ingressaclentrytemplates",
            RestError::new(500, "internal"),
        ));
        let (group, rules) = web_group();

        let err = h
            .manager
            .ensure(&group, &rules, &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchError::Remote(_)));
        assert_eq!(h.fake().count(Resource::PolicyGroup), 0);
        assert_eq!(h.fake().count(Resource::EgressAclEntry), 0);
        assert_eq!(h.manager.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_partial_population_unwinds_created_entries_newest_first() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let group = SecurityGroup {
            id: "sg-five".into(),
            name: "five".into(),
        };
        let rule = |id: &str, direction: Direction, protocol: &str, port: u32| {
            SecurityRule::new(id, "sg-five", direction)
                .with_protocol(protocol)
                .with_ports(Some(port), Some(port))
        };
        let rules = vec![
            rule("r-1", Direction::Ingress, "tcp", 22),
            rule("r-2", Direction::Egress, "tcp", 443),
            rule("r-3", Direction::Ingress, "tcp", 80),
            rule("r-4", Direction::Ingress, "udp", 53),
            rule("r-5", Direction::Egress, "tcp", 8080),
        ];
        h.fake().inject(
            Fault::new(RestMethod::Post, "aclentrytemplates", RestError::new(500, "entry refused")).after(2),
        );

        let err = h
            .manager
            .ensure(&group, &rules, &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap_err();

        match &err {
            OrchError::Remote(e) => {
                assert_eq!(e.status, 500);
                assert_eq!(e.message, "entry refused");
            }
            other => panic!("unexpected error: {other}"),
        }
        let deletes: Vec<String> = h
            .fake()
            .requests()
            .into_iter()
            .filter(|r| r.method == RestMethod::Delete)
            .map(|r| r.path)
            .collect();
        assert_eq!(deletes.len(), 3, "{deletes:?}");
        // r-2 (egress rule, ingress template), then r-1, then the group.
        assert!(deletes[0].starts_with("/ingressaclentrytemplates/"), "{deletes:?}");
        assert!(deletes[1].starts_with("/egressaclentrytemplates/"), "{deletes:?}");
        assert!(deletes[2].starts_with("/policygroups/"), "{deletes:?}");
        assert_eq!(h.fake().requests_matching(RestMethod::Delete, "aclentrytemplates"), 2);

        assert_eq!(h.fake().count(Resource::PolicyGroup), 0);
        assert_eq!(h.fake().count(Resource::IngressAclEntry), 0);
        assert_eq!(h.fake().count(Resource::EgressAclEntry), 0);
        assert_eq!(h.manager.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_stateful_icmp_gets_reverse_entry() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let group = SecurityGroup {
            id: "sg-icmp".into(),
            name: "icmp".into(),
        };
        let rules = vec![
            SecurityRule::new("r-unreach", "sg-icmp", Direction::Ingress)
                .with_protocol("icmp")
                .with_ports(Some(3), None),
            SecurityRule::new("r-echo", "sg-icmp", Direction::Ingress)
                .with_protocol("icmp")
                .with_ports(Some(8), Some(0)),
        ];

        h.manager
            .ensure(&group, &rules, &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap();
        assert_eq!(h.fake().count(Resource::EgressAclEntry), 2);
        assert_eq!(h.fake().count(Resource::IngressAclEntry), 1);

        let deleted = h.manager.delete_rule(&rules[0], PolicyGroupKind::Software).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(h.fake().count(Resource::IngressAclEntry), 0);
        assert_eq!(h.fake().count(Resource::EgressAclEntry), 1);
    }

    #[tokio::test]
    async fn test_stateless_group_has_no_reverse_entry() {
        let mut h = Harness::new();
        h.store.set_sg_stateful("sg-icmp", false);
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let group = SecurityGroup {
            id: "sg-icmp".into(),
            name: "icmp".into(),
        };
        let rules = vec![SecurityRule::new("r-any-icmp", "sg-icmp", Direction::Egress).with_protocol("icmp")];

        h.manager
            .ensure(&group, &rules, &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap();
        let entries = h.fake().objects(Resource::IngressAclEntry);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bool("stateful"), Some(false));
        assert_eq!(h.fake().count(Resource::EgressAclEntry), 0);
    }

    #[tokio::test]
    async fn test_remote_group_resolves_in_same_parent() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let group = SecurityGroup {
            id: "sg-app".into(),
            name: "app".into(),
        };
        let rules = vec![SecurityRule::new("r-db", "sg-app", Direction::Egress).with_remote_group("sg-db")];

        h.manager
            .ensure(&group, &rules, &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap();
        let remote = h
            .manager
            .find("sg-db", &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap()
            .unwrap();
        let entry = &h.fake().objects(Resource::IngressAclEntry)[0];
        assert_eq!(entry.str("networkType"), Some("POLICYGROUP"));
        assert_eq!(entry.str("networkID"), Some(remote.as_str()));
    }

    #[tokio::test]
    async fn test_hardware_group_gets_deny_template() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l2 = seed_l2domain(h.fake(), &ent, L2DomainOptions::default());
        let (group, rules) = web_group();

        let pg = h
            .manager
            .ensure(&group, &rules, &ParentDomain::l2domain(&l2.l2domain), PolicyGroupKind::Hardware)
            .await
            .unwrap();

        let stored = h.fake().object(&pg).unwrap();
        assert_eq!(stored.external_id(), Some("hw:sg-web@cms-test"));
        assert_eq!(stored.str("type"), Some("HARDWARE"));
        let templates = h.fake().children(&l2.l2domain, Resource::EgressAclTemplate);
        assert_eq!(templates.len(), 2);
        let hw_name = format!("hw:{}", l2.l2domain);
        let hw_template = templates.iter().find(|t| t.name() == Some(hw_name.as_str())).unwrap();
        let deny = h.fake().children(hw_template.id().unwrap(), Resource::EgressAclEntry);
        assert_eq!(deny.len(), 1);
        assert_eq!(deny[0].str("action"), Some("DROP"));
        assert_eq!(deny[0].str("locationID"), Some(pg.as_str()));

        // A second hardware group reuses the template.
        let other = SecurityGroup {
            id: "sg-other".into(),
            name: "other".into(),
        };
        h.manager
            .ensure(&other, &[], &ParentDomain::l2domain(&l2.l2domain), PolicyGroupKind::Hardware)
            .await
            .unwrap();
        assert_eq!(h.fake().children(&l2.l2domain, Resource::EgressAclTemplate).len(), 2);
        assert_eq!(h.fake().children(hw_template.id().unwrap(), Resource::EgressAclEntry).len(), 2);
    }

    #[tokio::test]
    async fn test_hardware_group_maps_remote_group_to_any_macro() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l2 = seed_l2domain(h.fake(), &ent, L2DomainOptions::default());
        let group = SecurityGroup {
            id: "sg-gw".into(),
            name: "gw".into(),
        };
        let rules = vec![SecurityRule::new("r-db", "sg-gw", Direction::Egress).with_remote_group("sg-db")];

        h.manager
            .ensure(&group, &rules, &ParentDomain::l2domain(&l2.l2domain), PolicyGroupKind::Hardware)
            .await
            .unwrap();

        let entries: Vec<_> = h
            .fake()
            .objects(Resource::IngressAclEntry)
            .into_iter()
            .filter(|e| e.external_id() == Some("hw:r-db@cms-test"))
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].str("networkType"), Some("ENTERPRISE_NETWORK"));
        let macro_id = entries[0].str("networkID").unwrap().to_string();
        let macros = h.fake().objects(Resource::EnterpriseNetwork);
        assert!(macros.iter().any(|m| m.id() == Some(macro_id.as_str())));
        // No policy group is created for the remote group.
        assert_eq!(h.fake().count(Resource::PolicyGroup), 1);
    }

    #[tokio::test]
    async fn test_check_unused_keeps_attached_groups() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let parent = ParentDomain::domain(&l3.domain);
        let used = h
            .manager
            .ensure(&SecurityGroup { id: "sg-a".into(), name: "a".into() }, &[], &parent, PolicyGroupKind::Software)
            .await
            .unwrap();
        let unused = h
            .manager
            .ensure(&SecurityGroup { id: "sg-b".into(), name: "b".into() }, &[], &parent, PolicyGroupKind::Software)
            .await
            .unwrap();
        let vport = h.fake().insert(Resource::Vport, Some((Resource::Subnet, l3.subnet.as_str())), json!({}));
        h.manager.set_vport_policy_groups(&vport, &[used.clone()]).await.unwrap();

        assert_eq!(h.manager.check_unused(&[], PolicyGroupKind::Software).await.unwrap(), 0);
        let deleted = h
            .manager
            .check_unused(&["sg-a".to_string(), "sg-b".to_string()], PolicyGroupKind::Software)
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(h.fake().object(&used).is_some());
        assert!(h.fake().object(&unused).is_none());
    }

    #[tokio::test]
    async fn test_delete_skips_group_in_use() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let l2 = seed_l2domain(h.fake(), &ent, L2DomainOptions::default());
        let group = SecurityGroup {
            id: "sg-a".into(),
            name: "a".into(),
        };
        let in_l3 = h
            .manager
            .ensure(&group, &[], &ParentDomain::domain(&l3.domain), PolicyGroupKind::Software)
            .await
            .unwrap();
        h.manager
            .ensure(&group, &[], &ParentDomain::l2domain(&l2.l2domain), PolicyGroupKind::Software)
            .await
            .unwrap();
        let vport = h.fake().insert(Resource::Vport, Some((Resource::Subnet, l3.subnet.as_str())), json!({}));
        h.fake().associate(&vport, Resource::PolicyGroup, &[&in_l3]);

        let deleted = h.manager.delete("sg-a", PolicyGroupKind::Software).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(h.fake().count(Resource::PolicyGroup), 1);
    }

    #[tokio::test]
    async fn test_add_rule_reaches_every_group() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let l2 = seed_l2domain(h.fake(), &ent, L2DomainOptions::default());
        let group = SecurityGroup {
            id: "sg-a".into(),
            name: "a".into(),
        };
        for parent in [ParentDomain::domain(&l3.domain), ParentDomain::l2domain(&l2.l2domain)] {
            h.manager.ensure(&group, &[], &parent, PolicyGroupKind::Software).await.unwrap();
        }

        let rule = SecurityRule::new("r-ssh", "sg-a", Direction::Ingress)
            .with_protocol("tcp")
            .with_ports(Some(22), Some(22));
        let created = h.manager.add_rule(&rule, PolicyGroupKind::Software).await.unwrap();

        assert_eq!(created, 2);
        assert_eq!(h.fake().count(Resource::EgressAclEntry), 2);
        assert_eq!(h.manager.delete_rule(&rule, PolicyGroupKind::Software).await.unwrap(), 2);
        assert_eq!(h.fake().count(Resource::EgressAclEntry), 0);
    }

    #[tokio::test]
    async fn test_allow_all_group() {
        let mut h = Harness::new();
        let ent = seed_enterprise(h.fake(), "acme");
        let l3 = seed_l3(h.fake(), &ent, true);
        let parent = ParentDomain::domain(&l3.domain);
        let vport = h.fake().insert(Resource::Vport, Some((Resource::Subnet, l3.subnet.as_str())), json!({}));

        let pg = h
            .manager
            .attach_allow_all(&vport, &parent, PolicyGroupKind::Software)
            .await
            .unwrap();
        assert_eq!(h.fake().object(&pg).unwrap().name(), Some(ALLOW_ALL_POLICY_GROUP));
        assert_eq!(h.fake().count(Resource::IngressAclEntry), 2);
        assert_eq!(h.fake().count(Resource::EgressAclEntry), 2);
        assert_eq!(h.fake().associated(&vport, Resource::PolicyGroup), vec![pg.clone()]);

        // Second call finds the group through the conflict.
        let again = h.manager.ensure_allow_all(&parent, PolicyGroupKind::Software).await.unwrap();
        assert_eq!(again, pg);
        assert_eq!(h.fake().count(Resource::IngressAclEntry), 2);

        assert!(h.manager.detach_allow_all(&vport, PolicyGroupKind::Software).await.unwrap());
        assert!(h.fake().associated(&vport, Resource::PolicyGroup).is_empty());
        assert!(!h.manager.detach_allow_all(&vport, PolicyGroupKind::Software).await.unwrap());
    }
}
