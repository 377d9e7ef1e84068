//! Lookups and creation helpers shared by the managers.
//!
//! Everything here talks to the VSD through [`RemoteControllerClient`] and
//! assumes the client is wrapped in [`IgnoreErrors`](nuage_vsd::IgnoreErrors),
//! so a GET of a missing object yields an empty list rather than a 404.

use crate::error::{OrchError, OrchResult};
use nuage_vsd::{NuageFilter, RemoteControllerClient, Resource, RestError, VsdErrorCode, VsdObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Builds the `externalID` stored on every object this agent creates.
pub fn external_id(id: &str, cms_id: &str) -> String {
    format!("{}@{}", id, cms_id)
}

/// Returns the local id part of an `externalID`.
pub fn strip_cms_id(external_id: &str) -> &str {
    external_id
        .split_once('@')
        .map_or(external_id, |(id, _)| id)
}

/// Kind of remote scope a policy group lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentKind {
    /// L3 domain behind a router.
    Domain,
    L2Domain,
}

impl ParentKind {
    pub const fn resource(&self) -> Resource {
        match self {
            ParentKind::Domain => Resource::Domain,
            ParentKind::L2Domain => Resource::L2Domain,
        }
    }

    /// Parses a `parentType` attribute.
    pub fn from_entity_name(name: &str) -> Option<Self> {
        match Resource::from_entity_name(name)? {
            Resource::Domain => Some(ParentKind::Domain),
            Resource::L2Domain => Some(ParentKind::L2Domain),
            _ => None,
        }
    }
}

/// A remote domain or L2 domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentDomain {
    pub id: String,
    pub kind: ParentKind,
}

impl ParentDomain {
    pub fn domain(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ParentKind::Domain,
        }
    }

    pub fn l2domain(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ParentKind::L2Domain,
        }
    }

    /// Reads the parent linkage of a VSD object.
    pub fn of(object: &VsdObject) -> Option<Self> {
        let kind = ParentKind::from_entity_name(object.parent_type()?)?;
        Some(Self {
            id: object.parent_id()?.to_string(),
            kind,
        })
    }

    pub fn path(&self) -> String {
        self.kind.resource().object_path(&self.id)
    }

    pub fn child_path(&self, child: Resource) -> String {
        self.kind.resource().child_path(&self.id, child)
    }
}

impl fmt::Display for ParentDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.resource(), self.id)
    }
}

/// What the managers need to know about a parent before posting into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentContext {
    pub parent: ParentDomain,
    /// Owner of network macros created for the parent's rules.
    pub enterprise_id: String,
    pub external_id: Option<String>,
    /// False only for L2 domains without VSD-managed DHCP.
    pub dhcp_managed: bool,
    pub ingress_acl: Option<String>,
    pub egress_acl: Option<String>,
}

impl ParentContext {
    /// Reads the parent object and its first ingress and egress ACL templates.
    pub async fn resolve<C>(client: &C, parent: &ParentDomain) -> OrchResult<Self>
    where
        C: RemoteControllerClient + ?Sized,
    {
        let object = fetch_required(client, parent.kind.resource(), &parent.id).await?;
        let enterprise_id = object
            .parent_id()
            .map(str::to_string)
            .ok_or_else(|| OrchError::Internal(format!("{} has no enterprise", parent)))?;
        let dhcp_managed = match parent.kind {
            ParentKind::Domain => true,
            ParentKind::L2Domain => object.bool("DHCPManaged").unwrap_or(true),
        };
        let ingress_acl = first_id(client, &parent.child_path(Resource::IngressAclTemplate)).await?;
        let egress_acl = first_id(client, &parent.child_path(Resource::EgressAclTemplate)).await?;
        Ok(Self {
            parent: parent.clone(),
            enterprise_id,
            external_id: object.external_id().map(str::to_string),
            dhcp_managed,
            ingress_acl,
            egress_acl,
        })
    }

    /// Fails when the parent has neither ACL template.
    pub fn require_acl_mapping(&self) -> OrchResult<()> {
        if self.ingress_acl.is_none() && self.egress_acl.is_none() {
            return Err(missing_acl_mapping(&self.parent));
        }
        Ok(())
    }
}

pub(crate) fn missing_acl_mapping(parent: &ParentDomain) -> OrchError {
    match parent.kind {
        ParentKind::Domain => OrchError::conflict(format!("Router {} does not have ACL mapping", parent.id)),
        ParentKind::L2Domain => OrchError::conflict(format!(
            "L2Domain {} of Security Group does not have ACL mapping",
            parent.id
        )),
    }
}

/// Outcome of a create call that may collide with an existing object.
#[derive(Debug, Clone, PartialEq)]
pub enum Creation<T> {
    Created(T),
    /// Another writer created the object first; this is the existing one.
    Found(T),
    /// The VSD reported the collision; the caller has to re-resolve.
    Conflict(RestError),
}

impl<T> Creation<T> {
    pub fn was_created(&self) -> bool {
        matches!(self, Creation::Created(_))
    }
}

/// Posts `body` and classifies an "already exists" answer carrying `exists`
/// as [`Creation::Conflict`]. Every other error propagates.
pub async fn post_classified<C>(
    client: &C,
    path: &str,
    body: Value,
    exists: &VsdErrorCode,
) -> OrchResult<Creation<VsdObject>>
where
    C: RemoteControllerClient + ?Sized,
{
    match client.post(path, body).await {
        Ok(created) => Ok(Creation::Created(first_object(created, path)?)),
        Err(e) if e.is_conflict_with(exists) => Ok(Creation::Conflict(e)),
        Err(e) => Err(e.into()),
    }
}

/// Posts `body` and returns the created object.
pub async fn create_one<C>(client: &C, path: &str, body: Value) -> OrchResult<VsdObject>
where
    C: RemoteControllerClient + ?Sized,
{
    let created = client.post(path, body).await?;
    first_object(created, path)
}

fn first_object(objects: Vec<VsdObject>, path: &str) -> OrchResult<VsdObject> {
    objects
        .into_iter()
        .next()
        .ok_or_else(|| OrchError::Internal(format!("VSD returned no object for POST {}", path)))
}

/// Returns the first object at `path`, treating 404 and an empty list alike.
pub async fn fetch<C>(client: &C, path: &str, filter: Option<&NuageFilter>) -> OrchResult<Option<VsdObject>>
where
    C: RemoteControllerClient + ?Sized,
{
    match client.get_one(path, filter).await {
        Ok(found) => Ok(found),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Returns every object at `path`, treating 404 as empty.
pub async fn fetch_all<C>(client: &C, path: &str, filter: Option<&NuageFilter>) -> OrchResult<Vec<VsdObject>>
where
    C: RemoteControllerClient + ?Sized,
{
    match client.get(path, filter).await {
        Ok(found) => Ok(found),
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Reads one object by id or fails with `NotFound`.
pub async fn fetch_required<C>(client: &C, kind: Resource, id: &str) -> OrchResult<VsdObject>
where
    C: RemoteControllerClient + ?Sized,
{
    fetch(client, &kind.object_path(id), None)
        .await?
        .ok_or_else(|| OrchError::not_found(kind.entity_name(), id))
}

async fn first_id<C>(client: &C, path: &str) -> OrchResult<Option<String>>
where
    C: RemoteControllerClient + ?Sized,
{
    Ok(fetch(client, path, None)
        .await?
        .and_then(|o| o.id().map(str::to_string)))
}

/// Walks subnet -> zone -> domain.
pub async fn domain_of_subnet<C>(client: &C, subnet_id: &str) -> OrchResult<ParentDomain>
where
    C: RemoteControllerClient + ?Sized,
{
    let subnet = fetch_required(client, Resource::Subnet, subnet_id).await?;
    let zone_id = subnet
        .parent_id()
        .ok_or_else(|| OrchError::not_found("zone of subnet", subnet_id))?;
    let zone = fetch_required(client, Resource::Zone, zone_id).await?;
    let domain_id = zone
        .parent_id()
        .ok_or_else(|| OrchError::not_found("domain of zone", zone_id))?;
    Ok(ParentDomain::domain(domain_id))
}

/// Finds the network macro for an address, creating it when absent.
///
/// A concurrent creation of the same macro is resolved by reading it back.
pub async fn ensure_network_macro<C>(
    client: &C,
    enterprise_id: &str,
    prefix: &nuage_types::IpPrefix,
    cms_id: &str,
) -> OrchResult<String>
where
    C: RemoteControllerClient + ?Sized,
{
    let path = Resource::Enterprise.child_path(enterprise_id, Resource::EnterpriseNetwork);
    let network = prefix.network();
    let filter = if prefix.is_ipv4() {
        NuageFilter::eq("address", network).and("netmask", prefix.netmask())
    } else {
        NuageFilter::eq("IPv6Address", prefix_string(prefix))
    };
    if let Some(existing) = fetch(client, &path, Some(&filter)).await? {
        return Ok(existing.require_id()?);
    }

    let name = format!("{}_{}", network, prefix.prefix_len()).replace([':', '.'], "-");
    let body = if prefix.is_ipv4() {
        serde_json::json!({
            "name": name,
            "address": network.to_string(),
            "netmask": prefix.netmask().to_string(),
            "IPType": "IPV4",
            "externalID": external_id(&name, cms_id),
        })
    } else {
        serde_json::json!({
            "name": name,
            "IPv6Address": prefix_string(prefix),
            "IPType": "IPV6",
            "externalID": external_id(&name, cms_id),
        })
    };
    match post_classified(client, &path, body, &VsdErrorCode::NetworkMacroExists).await? {
        Creation::Created(created) | Creation::Found(created) => Ok(created.require_id()?),
        Creation::Conflict(e) => fetch(client, &path, Some(&filter))
            .await?
            .map(|o| o.require_id())
            .transpose()?
            .ok_or(OrchError::Remote(e)),
    }
}

fn prefix_string(prefix: &nuage_types::IpPrefix) -> String {
    format!("{}/{}", prefix.network(), prefix.prefix_len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuage_orch_test::{seed_enterprise, seed_l2domain, seed_l3, FakeVsd, Fault, L2DomainOptions};
    use nuage_vsd::{IgnoreErrors, RestMethod};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_external_id() {
        assert_eq!(external_id("sg-1", "cms"), "sg-1@cms");
        assert_eq!(strip_cms_id("sg-1@cms"), "sg-1");
        assert_eq!(strip_cms_id("plain"), "plain");
    }

    #[test]
    fn test_parent_of_object() {
        let obj = VsdObject::new()
            .with("parentID", "d-1")
            .with("parentType", "l2domain");
        assert_eq!(ParentDomain::of(&obj), Some(ParentDomain::l2domain("d-1")));
        let zone_child = VsdObject::new()
            .with("parentID", "z-1")
            .with("parentType", "zone");
        assert_eq!(ParentDomain::of(&zone_child), None);
        assert_eq!(
            ParentDomain::domain("d-2").child_path(Resource::PolicyGroup),
            "/domains/d-2/policygroups"
        );
    }

    #[tokio::test]
    async fn test_resolve_parent_context() {
        let vsd = FakeVsd::new();
        let ent = seed_enterprise(&vsd, "acme");
        let l2 = seed_l2domain(&vsd, &ent, L2DomainOptions::default().unmanaged());
        let client = IgnoreErrors::new(vsd);

        let ctx = ParentContext::resolve(&client, &ParentDomain::l2domain(&l2.l2domain))
            .await
            .unwrap();
        assert_eq!(ctx.enterprise_id, ent);
        assert!(!ctx.dhcp_managed);
        assert_eq!(ctx.ingress_acl, l2.ingress_acl);
        assert_eq!(ctx.egress_acl, l2.egress_acl);
        assert!(ctx.require_acl_mapping().is_ok());
    }

    #[tokio::test]
    async fn test_missing_acl_mapping() {
        let vsd = FakeVsd::new();
        let ent = seed_enterprise(&vsd, "acme");
        let l3 = seed_l3(&vsd, &ent, false);
        let client = IgnoreErrors::new(vsd);

        let ctx = ParentContext::resolve(&client, &ParentDomain::domain(&l3.domain))
            .await
            .unwrap();
        let err = ctx.require_acl_mapping().unwrap_err();
        assert_eq!(err.to_string(), format!("Router {} does not have ACL mapping", l3.domain));

        let missing = ParentContext::resolve(&client, &ParentDomain::domain("nope")).await;
        assert!(matches!(missing, Err(OrchError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_domain_of_subnet() {
        let vsd = FakeVsd::new();
        let ent = seed_enterprise(&vsd, "acme");
        let l3 = seed_l3(&vsd, &ent, true);
        let client = IgnoreErrors::new(vsd);
        assert_eq!(
            domain_of_subnet(&client, &l3.subnet).await.unwrap(),
            ParentDomain::domain(&l3.domain)
        );
    }

    #[tokio::test]
    async fn test_network_macro_is_reused() {
        let vsd = FakeVsd::new();
        let ent = seed_enterprise(&vsd, "acme");
        let client = IgnoreErrors::new(vsd);
        let prefix: nuage_types::IpPrefix = "10.2.0.0/16".parse().unwrap();

        let first = ensure_network_macro(&client, &ent, &prefix, "cms").await.unwrap();
        let second = ensure_network_macro(&client, &ent, &prefix, "cms").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.inner().count(Resource::EnterpriseNetwork), 1);
        let created = client.inner().object(&first).unwrap();
        assert_eq!(created.str("netmask"), Some("255.255.0.0"));
    }

    #[tokio::test]
    async fn test_network_macro_race_is_resolved() {
        let vsd = FakeVsd::new();
        let ent = seed_enterprise(&vsd, "acme");
        let prefix: nuage_types::IpPrefix = "2001:db8::/64".parse().unwrap();
        let existing = vsd.insert(
            Resource::EnterpriseNetwork,
            Some((Resource::Enterprise, ent.as_str())),
            serde_json::json!({ "IPv6Address": "2001:db8::/64" }),
        );
        // The first lookup misses, as if the macro appeared right after it.
        vsd.inject(Fault::new(
            RestMethod::Get,
            "/enterprisenetworks",
            RestError::not_found("enterprisenetworks"),
        ));
        let client = IgnoreErrors::new(vsd);

        let id = ensure_network_macro(&client, &ent, &prefix, "cms").await.unwrap();
        assert_eq!(id, existing);
    }
}
