//! In-memory Resource Store and static inventory for deterministic tests
//!
//! [`MemoryStore`] emulates the API server behaviors the engine relies on:
//! generateName suffixes, UIDs, resource versions, creation timestamps,
//! equality label selectors, JSON merge patch, finalizers with deletion
//! timestamps, and garbage collection of dependents through
//! ownerReferences. Failures can be injected per operation and kind, and
//! every call is recorded.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ApiResource, DynamicObject, TypeMeta};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;

use crate::labels::{matches, Labels};
use crate::plan::{Inventory, SourceVm};
use crate::store::{object_ref, Propagation, ResourceStore};
use crate::{Error, Result};

/// Alphabet used by the API server for generateName suffixes
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const SUFFIX_LEN: usize = 5;

/// Store operation, for call logs and failure injection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// list
    List,
    /// get
    Get,
    /// create
    Create,
    /// update
    Update,
    /// patch
    Patch,
    /// delete
    Delete,
}

/// One recorded store call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    /// Operation
    pub op: Op,
    /// Resource kind
    pub kind: String,
    /// Namespace (None for cluster-wide calls)
    pub namespace: Option<String>,
    /// Object name, or generateName prefix for creates
    pub name: String,
}

type Key = (String, String, String, String);

fn key(ar: &ApiResource, namespace: Option<&str>, name: &str) -> Key {
    (
        ar.api_version.clone(),
        ar.kind.clone(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

struct State {
    objects: BTreeMap<Key, DynamicObject>,
    revision: u64,
    calls: Vec<Call>,
    failures: HashMap<(Op, String), fn(&str) -> Error>,
    suffixes: VecDeque<String>,
}

/// In-memory [`ResourceStore`]
pub struct MemoryStore {
    started: DateTime<Utc>,
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                revision: 0,
                calls: Vec::new(),
                failures: HashMap::new(),
                suffixes: VecDeque::new(),
            }),
        }
    }

    /// Make every `op` on `kind` fail with the error built by `make`
    pub fn fail(&self, op: Op, kind: &str, make: fn(&str) -> Error) {
        self.state.lock().failures.insert((op, kind.to_string()), make);
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Force the next generateName suffixes (to provoke name collisions)
    pub fn queue_suffixes<I, S>(&self, suffixes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .suffixes
            .extend(suffixes.into_iter().map(Into::into));
    }

    /// Recorded calls
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded `op` calls on `kind`
    pub fn count(&self, op: Op, kind: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op && c.kind == kind)
            .count()
    }

    /// All live objects of `kind`
    pub fn objects(&self, kind: &str) -> Vec<DynamicObject> {
        self.state
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.1 == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// All live objects of any kind whose labels match `selector`
    pub fn labeled(&self, selector: &Labels) -> Vec<DynamicObject> {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| matches(o.metadata.labels.as_ref(), selector))
            .cloned()
            .collect()
    }

    /// Insert an object as-is, bypassing create semantics other than
    /// defaulting uid/resourceVersion/creationTimestamp
    pub fn seed(&self, ar: &ApiResource, obj: DynamicObject) -> DynamicObject {
        let mut state = self.state.lock();
        let obj = self.stamp(&mut state, ar, obj);
        let name = obj.metadata.name.clone().unwrap_or_default();
        state.objects.insert(
            key(ar, obj.metadata.namespace.as_deref(), &name),
            obj.clone(),
        );
        obj
    }

    fn stamp(&self, state: &mut State, ar: &ApiResource, mut obj: DynamicObject) -> DynamicObject {
        state.revision += 1;
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        obj.metadata
            .uid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        obj.metadata.resource_version = Some(state.revision.to_string());
        obj.metadata.creation_timestamp.get_or_insert_with(|| {
            Time(self.started + chrono::Duration::seconds(state.revision as i64))
        });
        obj
    }

    fn record(state: &mut State, op: Op, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<()> {
        state.calls.push(Call {
            op,
            kind: ar.kind.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        });
        match state.failures.get(&(op, ar.kind.clone())) {
            Some(make) => Err(make(&object_ref(namespace, name))),
            None => Ok(()),
        }
    }

    fn next_suffix(state: &mut State) -> String {
        if let Some(s) = state.suffixes.pop_front() {
            return s;
        }
        let mut rng = rand::thread_rng();
        (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect()
    }

    /// Remove an object, or mark it terminating if it still has finalizers,
    /// then collect its dependents.
    fn remove(&self, state: &mut State, k: &Key) {
        let Some(obj) = state.objects.get_mut(k) else {
            return;
        };
        if obj.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            if obj.metadata.deletion_timestamp.is_none() {
                obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
            }
            return;
        }
        let Some(obj) = state.objects.remove(k) else {
            return;
        };
        let Some(uid) = obj.metadata.uid else {
            return;
        };
        let dependents: Vec<Key> = state
            .objects
            .iter()
            .filter(|(_, o)| {
                o.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for dep in dependents {
            self.remove(state, &dep);
        }
    }
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(target_map) = target {
                for (k, v) in patch_map {
                    if v.is_null() {
                        target_map.remove(k);
                    } else {
                        merge_patch(target_map.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        selector: Labels,
    ) -> Result<Vec<DynamicObject>> {
        let mut state = self.state.lock();
        Self::record(&mut state, Op::List, ar, namespace.as_deref(), "")?;
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.0 == ar.api_version && k.1 == ar.kind)
            .filter(|(k, _)| namespace.as_deref().is_none_or(|ns| k.2 == ns))
            .filter(|(_, o)| matches(o.metadata.labels.as_ref(), &selector))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        Self::record(&mut state, Op::Get, ar, namespace.as_deref(), &name)?;
        state
            .objects
            .get(&key(ar, namespace.as_deref(), &name))
            .cloned()
            .ok_or_else(|| Error::not_found(&ar.kind, object_ref(namespace.as_deref(), &name)))
    }

    async fn create(&self, ar: &ApiResource, mut obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        let namespace = obj.metadata.namespace.clone();
        let requested = obj
            .metadata
            .name
            .clone()
            .or_else(|| obj.metadata.generate_name.clone())
            .unwrap_or_default();
        Self::record(&mut state, Op::Create, ar, namespace.as_deref(), &requested)?;

        let name = match (&obj.metadata.name, &obj.metadata.generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => format!("{}{}", prefix, Self::next_suffix(&mut state)),
            (None, None) => {
                return Err(Error::validation(format!(
                    "{} create without name or generateName",
                    ar.kind
                )))
            }
        };
        let k = key(ar, namespace.as_deref(), &name);
        if state.objects.contains_key(&k) {
            return Err(Error::already_exists(&ar.kind, object_ref(namespace.as_deref(), &name)));
        }
        obj.metadata.name = Some(name);
        obj.metadata.uid = None;
        obj.metadata.creation_timestamp = None;
        let obj = self.stamp(&mut state, ar, obj);
        state.objects.insert(k, obj.clone());
        Ok(obj)
    }

    async fn update(&self, ar: &ApiResource, obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        let namespace = obj.metadata.namespace.clone();
        let name = obj.metadata.name.clone().unwrap_or_default();
        Self::record(&mut state, Op::Update, ar, namespace.as_deref(), &name)?;

        let k = key(ar, namespace.as_deref(), &name);
        let Some(current) = state.objects.get(&k) else {
            return Err(Error::not_found(&ar.kind, object_ref(namespace.as_deref(), &name)));
        };
        if let Some(rv) = &obj.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(rv) {
                return Err(Error::Conflict {
                    kind: ar.kind.clone(),
                    name: object_ref(namespace.as_deref(), &name),
                });
            }
        }
        let mut obj = obj;
        obj.metadata.uid = current.metadata.uid.clone();
        obj.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        let obj = self.stamp(&mut state, ar, obj);
        state.objects.insert(k, obj.clone());
        Ok(obj)
    }

    async fn patch_merge(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
        patch: Value,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        Self::record(&mut state, Op::Patch, ar, namespace.as_deref(), &name)?;

        let k = key(ar, namespace.as_deref(), &name);
        let Some(current) = state.objects.get(&k) else {
            return Err(Error::not_found(&ar.kind, object_ref(namespace.as_deref(), &name)));
        };
        let mut value = serde_json::to_value(current)
            .map_err(|e| Error::serialization(&ar.kind, e.to_string()))?;
        merge_patch(&mut value, &patch);
        let patched: DynamicObject = serde_json::from_value(value)
            .map_err(|e| Error::serialization(&ar.kind, e.to_string()))?;
        let patched = self.stamp(&mut state, ar, patched);
        let terminating = patched.metadata.deletion_timestamp.is_some();
        state.objects.insert(k.clone(), patched.clone());
        if terminating {
            self.remove(&mut state, &k);
        }
        Ok(patched)
    }

    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
        _propagation: Propagation,
    ) -> Result<()> {
        let mut state = self.state.lock();
        Self::record(&mut state, Op::Delete, ar, namespace.as_deref(), &name)?;

        let k = key(ar, namespace.as_deref(), &name);
        if !state.objects.contains_key(&k) {
            return Err(Error::not_found(&ar.kind, object_ref(namespace.as_deref(), &name)));
        }
        self.remove(&mut state, &k);
        Ok(())
    }
}

/// Fixed [`Inventory`] keyed by VM id
#[derive(Debug, Default, Clone)]
pub struct StaticInventory {
    vms: HashMap<String, SourceVm>,
}

impl StaticInventory {
    /// Inventory holding `vms`
    pub fn new(vms: impl IntoIterator<Item = SourceVm>) -> Self {
        Self {
            vms: vms.into_iter().map(|vm| (vm.id.clone(), vm)).collect(),
        }
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn vm(&self, id: &str) -> Result<SourceVm> {
        self.vms
            .get(id)
            .cloned()
            .ok_or_else(|| Error::inventory(id, "vm not found in inventory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::api_resource;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use serde_json::json;

    fn pod(generate: &str) -> DynamicObject {
        let ar = api_resource::<Pod>();
        let mut obj = DynamicObject::new("", &ar).within("ns");
        obj.metadata.name = None;
        obj.metadata.generate_name = Some(generate.to_string());
        obj.metadata.labels = Some(BTreeMap::from([("vmID".to_string(), "vm-1".to_string())]));
        obj
    }

    #[tokio::test]
    async fn test_generate_name_appends_suffix_and_collisions_surface() {
        let store = MemoryStore::new();
        let ar = api_resource::<Pod>();
        store.queue_suffixes(["aaaaa", "aaaaa"]);

        let first = store.create(&ar, pod("plan-vm-1-")).await.unwrap();
        assert_eq!(first.metadata.name.as_deref(), Some("plan-vm-1-aaaaa"));
        assert!(first.metadata.uid.is_some());
        assert!(first.metadata.creation_timestamp.is_some());

        let err = store.create(&ar, pod("plan-vm-1-")).await.unwrap_err();
        assert!(err.is_already_exists());

        let third = store.create(&ar, pod("plan-vm-1-")).await.unwrap();
        assert_eq!(third.metadata.name.as_deref().map(str::len), Some("plan-vm-1-".len() + 5));
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace_and_labels() {
        let store = MemoryStore::new();
        let ar = api_resource::<Pod>();
        store.create(&ar, pod("a-")).await.unwrap();
        let mut other = pod("b-");
        other.metadata.labels = Some(BTreeMap::from([("vmID".to_string(), "vm-2".to_string())]));
        store.create(&ar, other).await.unwrap();

        let sel = BTreeMap::from([("vmID".to_string(), "vm-1".to_string())]);
        assert_eq!(store.list(&ar, Some("ns".into()), sel.clone()).await.unwrap().len(), 1);
        assert_eq!(store.list(&ar, None, sel.clone()).await.unwrap().len(), 1);
        assert_eq!(store.list(&ar, Some("other".into()), sel).await.unwrap().len(), 0);
        assert_eq!(store.list(&ar, None, Labels::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_rejects_stale_resource_version() {
        let store = MemoryStore::new();
        let ar = api_resource::<Pod>();
        let created = store.create(&ar, pod("a-")).await.unwrap();

        let updated = store.update(&ar, created.clone()).await.unwrap();
        assert_ne!(updated.metadata.resource_version, created.metadata.resource_version);

        let err = store.update(&ar, created).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_finalizers_hold_deletion_until_stripped() {
        let store = MemoryStore::new();
        let ar = api_resource::<PersistentVolumeClaim>();
        let mut pvc = DynamicObject::new("claim", &ar).within("ns");
        pvc.metadata.finalizers = Some(vec!["populator/protect".to_string()]);
        store.create(&ar, pvc).await.unwrap();

        store
            .delete(&ar, Some("ns".into()), "claim".into(), Propagation::Background)
            .await
            .unwrap();
        let held = store.get(&ar, Some("ns".into()), "claim".into()).await.unwrap();
        assert!(held.metadata.deletion_timestamp.is_some());

        store
            .patch_merge(
                &ar,
                Some("ns".into()),
                "claim".into(),
                json!({"metadata": {"finalizers": null}}),
            )
            .await
            .unwrap();
        let err = store.get(&ar, Some("ns".into()), "claim".into()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_deleting_owner_collects_dependents() {
        let store = MemoryStore::new();
        let pod_ar = api_resource::<Pod>();
        let pvc_ar = api_resource::<PersistentVolumeClaim>();
        let owner = store.create(&pod_ar, pod("owner-")).await.unwrap();

        let mut pvc = DynamicObject::new("dep", &pvc_ar).within("ns");
        pvc.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            name: owner.metadata.name.clone().unwrap(),
            uid: owner.metadata.uid.clone().unwrap(),
            ..Default::default()
        }]);
        store.create(&pvc_ar, pvc).await.unwrap();

        store
            .delete(&pod_ar, Some("ns".into()), owner.metadata.name.unwrap(), Propagation::Foreground)
            .await
            .unwrap();
        assert!(store.objects("PersistentVolumeClaim").is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_returned_and_recorded() {
        let store = MemoryStore::new();
        let ar = api_resource::<Pod>();
        store.fail(Op::Create, "Pod", |name| Error::forbidden("Pod", name, "denied"));

        let err = store.create(&ar, pod("a-")).await.unwrap_err();
        assert!(err.is_forbidden());
        assert_eq!(store.count(Op::Create, "Pod"), 1);

        store.clear_failures();
        assert!(store.create(&ar, pod("a-")).await.is_ok());
    }

    #[test]
    fn test_merge_patch_follows_rfc7386() {
        let mut target = json!({"a": "b", "c": {"d": "e", "f": "g"}});
        merge_patch(&mut target, &json!({"a": "z", "c": {"f": null}}));
        assert_eq!(target, json!({"a": "z", "c": {"d": "e"}}));

        let mut target = json!({"a": [1, 2]});
        merge_patch(&mut target, &json!({"a": [3]}));
        assert_eq!(target, json!({"a": [3]}));
    }
}
