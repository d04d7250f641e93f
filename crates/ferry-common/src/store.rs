//! Resource Store: generic access to the target object space
//!
//! The engine talks to the target cluster exclusively through
//! [`ResourceStore`], an object-safe trait over `DynamicObject` scoped by
//! namespace and label selector. [`KubeStore`] backs it with kube-rs;
//! [`TypedStore`] layers typed conversions on top so the engine can work
//! with k8s-openapi and CRD structs directly.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    PropagationPolicy, TypeMeta,
};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use crate::labels::{selector, Labels};
use crate::{Error, Result};

// =============================================================================
// ApiResource helpers
// =============================================================================

/// Types with a compile-time known API version and kind that are not
/// modeled as Rust structs (e.g. provider-specific populator CRs).
pub trait HasApiResource {
    /// Full API version (e.g. "forklift.konveyor.io/v1beta1")
    const API_VERSION: &'static str;
    /// Resource kind
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an `ApiResource` from an apiVersion string and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Lowercase plural of a kind, following the API server's simple rules
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}

/// `namespace/name` (or just `name` for cluster-scoped objects)
pub fn object_ref(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

// =============================================================================
// ResourceStore
// =============================================================================

/// Delete propagation policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Propagation {
    /// Let the garbage collector remove dependents asynchronously
    #[default]
    Background,
    /// Remove dependents before the owner disappears
    Foreground,
    /// Leave dependents behind
    Orphan,
}

impl From<Propagation> for PropagationPolicy {
    fn from(p: Propagation) -> Self {
        match p {
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Orphan => PropagationPolicy::Orphan,
        }
    }
}

/// Generic list/get/create/update/patch/delete over the target object space.
///
/// Errors are classified (see [`Error::from_kube`]) so callers can match on
/// not-found and already-exists without inspecting status codes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// List objects matching every label in `selector`. `namespace = None`
    /// lists across all namespaces (or cluster-scoped kinds).
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        selector: Labels,
    ) -> Result<Vec<DynamicObject>>;

    /// Fetch one object by name
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
    ) -> Result<DynamicObject>;

    /// Create an object; `metadata.generateName` is honored when `name` is unset
    async fn create(&self, ar: &ApiResource, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace an object (optimistic on `resourceVersion` when set)
    async fn update(&self, ar: &ApiResource, obj: DynamicObject) -> Result<DynamicObject>;

    /// JSON merge patch (RFC 7386)
    async fn patch_merge(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
        patch: serde_json::Value,
    ) -> Result<DynamicObject>;

    /// Delete an object with the given propagation policy
    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
        propagation: Propagation,
    ) -> Result<()>;
}

/// kube-rs backed [`ResourceStore`]
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

fn with_types(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
    }
    obj
}

fn display_name(obj: &DynamicObject) -> String {
    let name = obj
        .metadata
        .name
        .as_deref()
        .or(obj.metadata.generate_name.as_deref())
        .unwrap_or_default();
    object_ref(obj.metadata.namespace.as_deref(), name)
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        labels: Labels,
    ) -> Result<Vec<DynamicObject>> {
        let lp = ListParams::default().labels(&selector(&labels));
        trace!(kind = %ar.kind, selector = ?lp.label_selector, "listing");
        let list = self
            .api(ar, namespace.as_deref())
            .list(&lp)
            .await
            .map_err(|e| Error::from_kube(&ar.kind, namespace.as_deref().unwrap_or("*"), e))?;
        Ok(list.items.into_iter().map(|o| with_types(o, ar)).collect())
    }

    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
    ) -> Result<DynamicObject> {
        self.api(ar, namespace.as_deref())
            .get(&name)
            .await
            .map(|o| with_types(o, ar))
            .map_err(|e| Error::from_kube(&ar.kind, object_ref(namespace.as_deref(), &name), e))
    }

    async fn create(&self, ar: &ApiResource, obj: DynamicObject) -> Result<DynamicObject> {
        let obj = with_types(obj, ar);
        self.api(ar, obj.metadata.namespace.as_deref())
            .create(&PostParams::default(), &obj)
            .await
            .map(|o| with_types(o, ar))
            .map_err(|e| Error::from_kube(&ar.kind, display_name(&obj), e))
    }

    async fn update(&self, ar: &ApiResource, obj: DynamicObject) -> Result<DynamicObject> {
        let obj = with_types(obj, ar);
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.api(ar, obj.metadata.namespace.as_deref())
            .replace(&name, &PostParams::default(), &obj)
            .await
            .map(|o| with_types(o, ar))
            .map_err(|e| Error::from_kube(&ar.kind, display_name(&obj), e))
    }

    async fn patch_merge(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
        patch: serde_json::Value,
    ) -> Result<DynamicObject> {
        self.api(ar, namespace.as_deref())
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|o| with_types(o, ar))
            .map_err(|e| Error::from_kube(&ar.kind, object_ref(namespace.as_deref(), &name), e))
    }

    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
        propagation: Propagation,
    ) -> Result<()> {
        let dp = DeleteParams {
            propagation_policy: Some(propagation.into()),
            ..Default::default()
        };
        self.api(ar, namespace.as_deref())
            .delete(&name, &dp)
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(&ar.kind, object_ref(namespace.as_deref(), &name), e))
    }
}

// =============================================================================
// Typed access
// =============================================================================

/// Any statically typed Kubernetes resource the engine reads or writes
pub trait Kind:
    kube::Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync
{
}

impl<T> Kind for T where
    T: kube::Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync
{
}

/// ApiResource of a typed kind
pub fn api_resource<K: Kind>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Convert a typed object into a `DynamicObject`
pub fn to_dynamic<K: Kind>(obj: &K) -> Result<DynamicObject> {
    let mut value =
        serde_json::to_value(obj).map_err(|e| Error::serialization(K::kind(&()), e.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| K::api_version(&()).into_owned().into());
        map.entry("kind")
            .or_insert_with(|| K::kind(&()).into_owned().into());
    }
    serde_json::from_value(value).map_err(|e| Error::serialization(K::kind(&()), e.to_string()))
}

/// Convert a `DynamicObject` into a typed object
pub fn from_dynamic<K: Kind>(mut obj: DynamicObject) -> Result<K> {
    obj.types.get_or_insert_with(|| TypeMeta {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
    });
    let value =
        serde_json::to_value(&obj).map_err(|e| Error::serialization(K::kind(&()), e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization(K::kind(&()), e.to_string()))
}

/// Typed facade over a shared [`ResourceStore`]
#[derive(Clone)]
pub struct TypedStore {
    inner: Arc<dyn ResourceStore>,
}

impl TypedStore {
    /// Wrap a store
    pub fn new(inner: Arc<dyn ResourceStore>) -> Self {
        Self { inner }
    }

    /// The underlying untyped store
    pub fn raw(&self) -> &dyn ResourceStore {
        self.inner.as_ref()
    }

    /// List typed objects by label selector
    pub async fn list<K: Kind>(&self, namespace: Option<&str>, labels: &Labels) -> Result<Vec<K>> {
        self.inner
            .list(
                &api_resource::<K>(),
                namespace.map(str::to_string),
                labels.clone(),
            )
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    /// Fetch one typed object
    pub async fn get<K: Kind>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        let obj = self
            .inner
            .get(
                &api_resource::<K>(),
                namespace.map(str::to_string),
                name.to_string(),
            )
            .await?;
        from_dynamic(obj)
    }

    /// Fetch one typed object, mapping not-found to `None`
    pub async fn find<K: Kind>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        match self.get(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create a typed object
    pub async fn create<K: Kind>(&self, obj: &K) -> Result<K> {
        let created = self
            .inner
            .create(&api_resource::<K>(), to_dynamic(obj)?)
            .await?;
        from_dynamic(created)
    }

    /// Replace a typed object
    pub async fn update<K: Kind>(&self, obj: &K) -> Result<K> {
        let updated = self
            .inner
            .update(&api_resource::<K>(), to_dynamic(obj)?)
            .await?;
        from_dynamic(updated)
    }

    /// Merge-patch a typed object
    pub async fn patch_merge<K: Kind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<K> {
        let patched = self
            .inner
            .patch_merge(
                &api_resource::<K>(),
                namespace.map(str::to_string),
                name.to_string(),
                patch,
            )
            .await?;
        from_dynamic(patched)
    }

    /// Delete a typed object
    pub async fn delete<K: Kind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        propagation: Propagation,
    ) -> Result<()> {
        self.inner
            .delete(
                &api_resource::<K>(),
                namespace.map(str::to_string),
                name.to_string(),
                propagation,
            )
            .await
    }
}
