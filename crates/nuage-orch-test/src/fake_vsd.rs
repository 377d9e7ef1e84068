//! In-memory VSD used by integration tests.
//!
//! [`FakeVsd`] keeps a graph of VSD objects keyed by id, each carrying
//! `parentID`/`parentType`, and answers the REST paths the agent uses:
//!
//! - `/<kind>` lists every object of a kind (GET) or creates a root (POST)
//! - `/<kind>/<id>` reads, updates or deletes one object
//! - `/<kind>/<id>/<child kind>` lists or creates children, or reads and
//!   replaces an association (`/vports/<id>/policygroups`)
//!
//! The uniqueness rules VSD enforces are reproduced with their error codes,
//! so conflict handling can be exercised end to end. Faults can be injected
//! per verb and path fragment, and every request is logged.

use async_trait::async_trait;
use nuage_vsd::api::FILTER_HEADER;
use nuage_vsd::error::status;
use nuage_vsd::{RemoteControllerClient, Resource, RestError, RestMethod, RestRequest, RestResult, VsdErrorCode, VsdObject};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// An error returned instead of executing a matching request.
#[derive(Debug, Clone)]
pub struct Fault {
    method: RestMethod,
    path_fragment: String,
    error: RestError,
    skip: usize,
    remaining: usize,
}

impl Fault {
    /// Fails the next `method` request whose path contains `path_fragment`.
    pub fn new(method: RestMethod, path_fragment: impl Into<String>, error: RestError) -> Self {
        Self {
            method,
            path_fragment: path_fragment.into(),
            error,
            skip: 0,
            remaining: 1,
        }
    }

    /// Lets the first `n` matching requests through.
    pub fn after(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Fails `n` matching requests instead of one.
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = n;
        self
    }

    /// Fails every matching request.
    pub fn always(self) -> Self {
        self.times(usize::MAX)
    }

    fn matches(&self, request: &RestRequest) -> bool {
        self.method == request.method && request.path.contains(&self.path_fragment)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    kind: Resource,
    seq: u64,
    object: VsdObject,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Entry>,
    /// (owner id, member kind) -> member ids
    associations: HashMap<(String, Resource), Vec<String>>,
    requests: Vec<RestRequest>,
    faults: Vec<Fault>,
    seq: u64,
}

/// In-memory stand-in for a VSD.
#[derive(Debug, Default)]
pub struct FakeVsd {
    state: Mutex<State>,
}

impl FakeVsd {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stores an object directly, bypassing uniqueness checks and the
    /// request log. Returns the generated id.
    pub fn insert(&self, kind: Resource, parent: Option<(Resource, &str)>, attrs: Value) -> String {
        let mut state = self.lock();
        let object = VsdObject::from_value(attrs).unwrap_or_default();
        state.store(kind, parent.map(|(k, id)| (k, id.to_string())), object)
    }

    /// Returns a stored object by id.
    pub fn object(&self, id: &str) -> Option<VsdObject> {
        self.lock().objects.get(id).map(|e| e.object.clone())
    }

    /// Returns every stored object of `kind`, oldest first.
    pub fn objects(&self, kind: Resource) -> Vec<VsdObject> {
        self.lock().list(kind, None)
    }

    /// Returns the children of `parent_id` of `kind`, oldest first.
    pub fn children(&self, parent_id: &str, kind: Resource) -> Vec<VsdObject> {
        self.lock().list(kind, Some(parent_id))
    }

    pub fn count(&self, kind: Resource) -> usize {
        self.objects(kind).len()
    }

    /// Replaces the `member` association of `owner_id`.
    pub fn associate(&self, owner_id: &str, member: Resource, ids: &[&str]) {
        self.lock().associations.insert(
            (owner_id.to_string(), member),
            ids.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Returns the ids associated to `owner_id`.
    pub fn associated(&self, owner_id: &str, member: Resource) -> Vec<String> {
        self.lock()
            .associations
            .get(&(owner_id.to_string(), member))
            .cloned()
            .unwrap_or_default()
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<RestRequest> {
        self.lock().requests.clone()
    }

    /// Number of POST, PUT and DELETE requests received.
    pub fn mutating_requests(&self) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.method.is_mutating())
            .count()
    }

    /// Number of `method` requests whose path contains `fragment`.
    pub fn requests_matching(&self, method: RestMethod, fragment: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.method == method && r.path.contains(fragment))
            .count()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }
}

#[async_trait]
impl RemoteControllerClient for FakeVsd {
    async fn request(&self, request: RestRequest) -> RestResult<Vec<VsdObject>> {
        let mut state = self.lock();
        state.requests.push(request.clone());
        if let Some(error) = state.take_fault(&request) {
            debug!(method = %request.method, path = %request.path, %error, "injected fault");
            return Err(error);
        }
        state.handle(&request)
    }
}

impl State {
    fn take_fault(&mut self, request: &RestRequest) -> Option<RestError> {
        for fault in self.faults.iter_mut().filter(|f| f.matches(request)) {
            if fault.skip > 0 {
                fault.skip -= 1;
                continue;
            }
            if fault.remaining > 0 {
                fault.remaining = fault.remaining.saturating_sub(1);
                return Some(fault.error.clone());
            }
        }
        None
    }

    fn store(&mut self, kind: Resource, parent: Option<(Resource, String)>, mut object: VsdObject) -> String {
        let id = object
            .id()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        object.set("ID", id.clone());
        if let Some((parent_kind, parent_id)) = parent {
            object.set("parentID", parent_id);
            object.set("parentType", parent_kind.entity_name());
        }
        self.seq += 1;
        self.objects.insert(
            id.clone(),
            Entry {
                kind,
                seq: self.seq,
                object,
            },
        );
        id
    }

    fn list(&self, kind: Resource, parent_id: Option<&str>) -> Vec<VsdObject> {
        let mut entries: Vec<&Entry> = self
            .objects
            .values()
            .filter(|e| e.kind == kind)
            .filter(|e| parent_id.map_or(true, |p| e.object.parent_id() == Some(p)))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.object.clone()).collect()
    }

    fn entry(&self, kind: Resource, id: &str) -> RestResult<&Entry> {
        self.objects
            .get(id)
            .filter(|e| e.kind == kind)
            .ok_or_else(|| RestError::not_found(format!("{} {}", kind, id)))
    }

    fn handle(&mut self, request: &RestRequest) -> RestResult<Vec<VsdObject>> {
        let path = request.path.split('?').next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let filter = request.header(FILTER_HEADER).map(Filter::parse).transpose()?;

        let result = match (request.method, segments.as_slice()) {
            (RestMethod::Get, [coll]) => self.list(kind_of(coll)?, None),
            (RestMethod::Post, [coll]) => {
                let kind = kind_of(coll)?;
                vec![self.create(kind, None, body_object(request)?)?]
            }
            (RestMethod::Get, [coll, id]) => vec![self.entry(kind_of(coll)?, id)?.object.clone()],
            (RestMethod::Put, [coll, id]) => {
                self.update(kind_of(coll)?, id, body_object(request)?)?;
                Vec::new()
            }
            (RestMethod::Delete, [coll, id]) => {
                self.delete(kind_of(coll)?, id)?;
                Vec::new()
            }
            (RestMethod::Get, [coll, id, child]) => self.children_of(kind_of(coll)?, id, kind_of(child)?)?,
            (RestMethod::Post, [coll, id, child]) => {
                let parent = kind_of(coll)?;
                self.entry(parent, id)?;
                let object = body_object(request)?;
                vec![self.create(kind_of(child)?, Some((parent, id.to_string())), object)?]
            }
            (RestMethod::Put, [coll, id, child]) => {
                self.set_association(kind_of(coll)?, id, kind_of(child)?, request.body.as_ref())?;
                Vec::new()
            }
            _ => {
                return Err(RestError::new(
                    status::BAD_REQUEST,
                    format!("unsupported request {} {}", request.method, request.path),
                ))
            }
        };

        Ok(match filter {
            Some(filter) => result.into_iter().filter(|o| filter.matches(o)).collect(),
            None => result,
        })
    }

    fn siblings(&self, kind: Resource, parent: Option<&(Resource, String)>) -> Vec<VsdObject> {
        self.list(kind, parent.map(|(_, id)| id.as_str()))
    }

    fn check_unique(&self, kind: Resource, parent: Option<&(Resource, String)>, object: &VsdObject) -> RestResult<()> {
        let same = |fields: &[&str], other: &VsdObject| {
            fields
                .iter()
                .all(|f| object.get(f).is_some() && object.get(f) == other.get(f))
        };
        let siblings = self.siblings(kind, parent);
        let clash = |fields: &[&str]| siblings.iter().any(|other| same(fields, other));

        match kind {
            Resource::PolicyGroup if clash(&["externalID"]) => Err(RestError::conflict(
                VsdErrorCode::PolicyGroupExists,
                "A policy group with the same external ID already exists",
            )),
            Resource::IngressAclEntry | Resource::EgressAclEntry | Resource::IngressAdvFwdEntry
                if clash(&["priority"]) =>
            {
                Err(RestError::conflict(
                    VsdErrorCode::PriorityConflict,
                    "Another entry with the same priority already exists",
                ))
            }
            Resource::IngressAclTemplate | Resource::EgressAclTemplate if clash(&["priority"]) => {
                Err(RestError::conflict(
                    VsdErrorCode::DuplicateAclPriority,
                    "Another ACL template with the same priority already exists",
                ))
            }
            Resource::EnterpriseNetwork if clash(&["address", "netmask"]) || clash(&["IPv6Address"]) => {
                Err(RestError::conflict(
                    VsdErrorCode::NetworkMacroExists,
                    "A network macro with the same address already exists",
                ))
            }
            Resource::Permission if clash(&["permittedEntityID"]) => Err(RestError::conflict(
                VsdErrorCode::PermissionExists,
                "The permission already exists",
            )),
            _ => Ok(()),
        }
    }

    fn create(&mut self, kind: Resource, parent: Option<(Resource, String)>, mut object: VsdObject) -> RestResult<VsdObject> {
        object.remove("ID");
        self.check_unique(kind, parent.as_ref(), &object)?;
        let interfaces = if kind == Resource::Vm {
            object.remove("interfaces")
        } else {
            None
        };
        let id = self.store(kind, parent, object);
        if let Some(Value::Array(interfaces)) = interfaces {
            for interface in interfaces.into_iter().filter_map(VsdObject::from_value) {
                self.store(Resource::VmInterface, Some((Resource::Vm, id.clone())), interface);
            }
        }
        Ok(self.entry(kind, &id)?.object.clone())
    }

    fn update(&mut self, kind: Resource, id: &str, body: VsdObject) -> RestResult<()> {
        let current = self.entry(kind, id)?.object.clone();
        let changes: Vec<(String, Value)> = body
            .as_map()
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "ID" | "parentID" | "parentType"))
            .filter(|(k, v)| current.get(k) != Some(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if changes.is_empty() {
            return Err(RestError::conflict(
                VsdErrorCode::NoAttributeChanges,
                "There are no attribute changes to modify the entity.",
            ));
        }
        if let Some(entry) = self.objects.get_mut(id) {
            for (key, value) in changes {
                entry.object.set(key, value);
            }
        }
        Ok(())
    }

    fn delete(&mut self, kind: Resource, id: &str) -> RestResult<()> {
        self.entry(kind, id)?;
        if kind == Resource::PolicyGroup && self.has_members(id, Resource::PolicyGroup) {
            return Err(RestError::conflict(
                VsdErrorCode::PolicyGroupInUse,
                "Policy group is in use by one or more vports",
            ));
        }
        self.remove_tree(id);
        Ok(())
    }

    fn has_members(&self, member_id: &str, member: Resource) -> bool {
        self.associations
            .iter()
            .any(|((_, k), ids)| *k == member && ids.iter().any(|i| i == member_id))
    }

    fn remove_tree(&mut self, id: &str) {
        let children: Vec<String> = self
            .objects
            .iter()
            .filter(|(_, e)| e.object.parent_id() == Some(id))
            .map(|(child, _)| child.clone())
            .collect();
        for child in children {
            self.remove_tree(&child);
        }
        self.objects.remove(id);
        self.associations.retain(|(owner, _), _| owner != id);
        for ids in self.associations.values_mut() {
            ids.retain(|i| i != id);
        }
    }

    fn children_of(&self, parent: Resource, id: &str, child: Resource) -> RestResult<Vec<VsdObject>> {
        self.entry(parent, id)?;
        if is_association(parent, child) {
            let ids = self
                .associations
                .get(&(id.to_string(), child))
                .cloned()
                .unwrap_or_default();
            return Ok(ids
                .iter()
                .filter_map(|i| self.objects.get(i))
                .map(|e| e.object.clone())
                .collect());
        }
        if is_association(child, parent) {
            let mut owners: Vec<&Entry> = self
                .associations
                .iter()
                .filter(|((_, member), ids)| *member == parent && ids.iter().any(|i| i == id))
                .filter_map(|((owner, _), _)| self.objects.get(owner))
                .collect();
            owners.sort_by_key(|e| e.seq);
            return Ok(owners.into_iter().map(|e| e.object.clone()).collect());
        }
        Ok(self.list(child, Some(id)))
    }

    fn set_association(&mut self, owner: Resource, id: &str, member: Resource, body: Option<&Value>) -> RestResult<()> {
        self.entry(owner, id)?;
        if !is_association(owner, member) {
            return Err(RestError::new(
                status::BAD_REQUEST,
                format!("{} has no {} association", owner, member),
            ));
        }
        let ids: Vec<String> = match body {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => {
                return Err(RestError::new(
                    status::BAD_REQUEST,
                    "association body must be a list of ids",
                ))
            }
        };
        for member_id in &ids {
            self.entry(member, member_id)?;
        }
        self.associations.insert((id.to_string(), member), ids);
        Ok(())
    }
}

fn is_association(owner: Resource, member: Resource) -> bool {
    owner == Resource::Vport && matches!(member, Resource::PolicyGroup | Resource::RedirectionTarget)
}

fn kind_of(segment: &str) -> RestResult<Resource> {
    Resource::from_rest_name(segment).ok_or_else(|| RestError::not_found(format!("resource {}", segment)))
}

fn body_object(request: &RestRequest) -> RestResult<VsdObject> {
    request
        .body
        .clone()
        .and_then(VsdObject::from_value)
        .ok_or_else(|| RestError::new(status::BAD_REQUEST, "request body must be a JSON object"))
}

/// A parsed `X-Nuage-Filter` expression.
#[derive(Debug, Clone, PartialEq)]
struct Filter {
    clauses: Vec<Vec<(String, String)>>,
}

impl Filter {
    fn parse(expression: &str) -> RestResult<Self> {
        let invalid = || RestError::new(status::BAD_REQUEST, format!("invalid filter: {}", expression));
        let mut clauses = Vec::new();
        for clause in expression.split(" or ") {
            let mut terms = Vec::new();
            for term in clause.split(" and ") {
                let (field, value) = term.split_once(" IS ").ok_or_else(invalid)?;
                let value = value
                    .trim()
                    .strip_prefix('\'')
                    .and_then(|v| v.strip_suffix('\''))
                    .ok_or_else(invalid)?;
                terms.push((field.trim().to_string(), value.to_string()));
            }
            clauses.push(terms);
        }
        Ok(Self { clauses })
    }

    fn matches(&self, object: &VsdObject) -> bool {
        self.clauses.iter().any(|clause| {
            clause
                .iter()
                .all(|(field, value)| field_text(object, field).as_deref() == Some(value.as_str()))
        })
    }
}

fn field_text(object: &VsdObject, field: &str) -> Option<String> {
    match object.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
