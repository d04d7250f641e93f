//! Ownership label scheme
//!
//! Every object the engine creates carries the ownership triple
//! (migration, plan, vm) as labels. Generated object names are random, so
//! these labels are the only identity used for idempotent lookups. Some
//! queries deliberately drop the migration label so that a retried migration
//! of the same plan adopts what the previous attempt left behind.

use std::collections::{BTreeMap, BTreeSet};

use kube::api::DynamicObject;

/// Migration label (value = migration UID)
pub const LABEL_MIGRATION: &str = "migration";
/// Plan label (value = plan UID)
pub const LABEL_PLAN: &str = "plan";
/// VM label (value = source VM id)
pub const LABEL_VM: &str = "vmID";
/// Role marker for helper pods
pub const LABEL_APP: &str = "ferry.app";
/// Role value of the pod that binds populator claims
pub const ROLE_CONSUMER: &str = "consumer";
/// Role value of the guest conversion pod
pub const ROLE_CONVERSION: &str = "virt-v2v";
/// Label carried by LUN volumes and claims, used as their identity
pub const LABEL_VOLUME: &str = "volume";
/// Label set by the job controller on pods it owns
pub const LABEL_JOB_NAME: &str = "job-name";
/// Label set on the VM template so the VM's pods are selectable by VM name
pub const LABEL_TEMPLATE_APP: &str = "app";

/// Transfer network for pods and importers
pub const ANN_DEFAULT_NETWORK: &str = "v1.multus-cni.io/default-network";
/// Template validations, removed from VMs created from templates
pub const ANN_VALIDATIONS: &str = "vm.kubevirt.io/validations";
/// Importer pod name recorded on a claim by CDI
pub const ANN_IMPORTER_POD: &str = "cdi.kubevirt.io/storage.import.importPodName";
/// Original source VM name, set when the name had to be rewritten
pub const ANN_ORIGINAL_NAME: &str = "original-name";
/// Original source VM id, set when the name had to be rewritten
pub const ANN_ORIGINAL_ID: &str = "original-ID";
/// DataVolume garbage collection after completion
pub const ANN_DELETE_AFTER_COMPLETION: &str = "cdi.kubevirt.io/storage.deleteAfterCompletion";
/// Ask CDI to bind the claim without waiting for a consumer
pub const ANN_BIND_IMMEDIATE: &str = "cdi.kubevirt.io/storage.bind.immediate.requested";
/// Keep the importer pod after the import completes
pub const ANN_RETAIN_AFTER_COMPLETION: &str = "cdi.kubevirt.io/storage.pod.retainAfterCompletion";

/// Label map type used throughout the engine
pub type Labels = BTreeMap<String, String>;

/// The (migration, plan, vm) key identifying which attempt an object belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnershipKey {
    /// Migration UID
    pub migration: String,
    /// Plan UID
    pub plan: String,
    /// Source VM id
    pub vm: String,
}

impl OwnershipKey {
    /// Read the triple back from an object's labels
    pub fn from_labels(labels: &Labels) -> Option<Self> {
        Some(Self {
            migration: labels.get(LABEL_MIGRATION)?.clone(),
            plan: labels.get(LABEL_PLAN)?.clone(),
            vm: labels.get(LABEL_VM)?.clone(),
        })
    }
}

/// Builds label sets for one (migration, plan) pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipLabels {
    migration: String,
    plan: String,
}

impl OwnershipLabels {
    /// Scheme for a migration attempt of a plan
    pub fn new(migration: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            migration: migration.into(),
            plan: plan.into(),
        }
    }

    /// Migration UID
    pub fn migration(&self) -> &str {
        &self.migration
    }

    /// Plan UID
    pub fn plan(&self) -> &str {
        &self.plan
    }

    /// Full ownership key for a VM
    pub fn key(&self, vm: &str) -> OwnershipKey {
        OwnershipKey {
            migration: self.migration.clone(),
            plan: self.plan.clone(),
            vm: vm.to_string(),
        }
    }

    /// `{migration, plan}`
    pub fn plan_labels(&self) -> Labels {
        BTreeMap::from([
            (LABEL_MIGRATION.to_string(), self.migration.clone()),
            (LABEL_PLAN.to_string(), self.plan.clone()),
        ])
    }

    /// `{plan}`; survives retried migrations
    pub fn plan_only(&self) -> Labels {
        BTreeMap::from([(LABEL_PLAN.to_string(), self.plan.clone())])
    }

    /// `{migration, plan, vmID}`
    pub fn vm_labels(&self, vm: &str) -> Labels {
        let mut labels = self.plan_labels();
        labels.insert(LABEL_VM.to_string(), vm.to_string());
        labels
    }

    /// `{plan, vmID}`; survives retried migrations
    pub fn vm_all_but_migration(&self, vm: &str) -> Labels {
        let mut labels = self.vm_labels(vm);
        labels.remove(LABEL_MIGRATION);
        labels
    }

    /// `{migration, vmID}`; matches claims created by any plan revision
    pub fn migration_vm(&self, vm: &str) -> Labels {
        BTreeMap::from([
            (LABEL_MIGRATION.to_string(), self.migration.clone()),
            (LABEL_VM.to_string(), vm.to_string()),
        ])
    }

    /// Labels of the pod binding populator claims
    pub fn consumer_labels(&self, vm: &str, without_migration: bool) -> Labels {
        self.role_labels(vm, without_migration, ROLE_CONSUMER)
    }

    /// Labels of the guest conversion pod
    pub fn conversion_labels(&self, vm: &str, without_migration: bool) -> Labels {
        self.role_labels(vm, without_migration, ROLE_CONVERSION)
    }

    fn role_labels(&self, vm: &str, without_migration: bool, role: &str) -> Labels {
        let mut labels = if without_migration {
            self.vm_all_but_migration(vm)
        } else {
            self.vm_labels(vm)
        };
        labels.insert(LABEL_APP.to_string(), role.to_string());
        labels
    }
}

/// Render a label map as an equality selector (`a=1,b=2`)
pub fn selector(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// True when every entry of `selector` is present in `labels`
pub fn matches(labels: Option<&Labels>, selector: &Labels) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// Secondary index from ownership key to object names
///
/// Used where native owner references do not apply, e.g. populator claims
/// whose lifecycle is driven by an external controller. It holds names only,
/// never strong references: the store does not enforce referential
/// integrity, so every lookup through the index must tolerate the object
/// having disappeared.
#[derive(Debug, Default, Clone)]
pub struct OwnershipIndex {
    entries: BTreeMap<OwnershipKey, BTreeSet<String>>,
}

impl OwnershipIndex {
    /// Index objects by the ownership triple found on their labels.
    /// Objects missing any of the three labels are skipped.
    pub fn from_objects<'a>(objects: impl IntoIterator<Item = &'a DynamicObject>) -> Self {
        let mut index = Self::default();
        for obj in objects {
            let Some(labels) = obj.metadata.labels.as_ref() else {
                continue;
            };
            if let (Some(key), Some(name)) =
                (OwnershipKey::from_labels(labels), obj.metadata.name.as_ref())
            {
                index.insert(key, name.clone());
            }
        }
        index
    }

    /// Record `name` under `key`
    pub fn insert(&mut self, key: OwnershipKey, name: impl Into<String>) {
        self.entries.entry(key).or_default().insert(name.into());
    }

    /// Names recorded for `key`
    pub fn names(&self, key: &OwnershipKey) -> impl Iterator<Item = &str> {
        self.entries
            .get(key)
            .into_iter()
            .flat_map(|names| names.iter().map(String::as_str))
    }

    /// Names recorded for a VM of a plan, across all migration attempts
    pub fn names_for_vm<'a>(&'a self, plan: &'a str, vm: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.plan == plan && k.vm == vm)
            .flat_map(|(_, names)| names.iter().map(String::as_str))
    }

    /// Drop `name` from `key` (after a confirmed delete)
    pub fn remove(&mut self, key: &OwnershipKey, name: &str) {
        if let Some(names) = self.entries.get_mut(key) {
            names.remove(name);
            if names.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is indexed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::{ApiResource, ObjectMeta};

    fn scheme() -> OwnershipLabels {
        OwnershipLabels::new("mig-1", "plan-1")
    }

    fn object(name: &str, labels: Labels) -> DynamicObject {
        let ar = ApiResource::erase::<k8s_openapi::api::core::v1::PersistentVolumeClaim>(&());
        let mut obj = DynamicObject::new(name, &ar);
        obj.metadata = ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        };
        obj
    }

    #[test]
    fn test_vm_labels_carry_full_triple() {
        let labels = scheme().vm_labels("vm-7");
        assert_eq!(labels.get(LABEL_MIGRATION).map(String::as_str), Some("mig-1"));
        assert_eq!(labels.get(LABEL_PLAN).map(String::as_str), Some("plan-1"));
        assert_eq!(labels.get(LABEL_VM).map(String::as_str), Some("vm-7"));
        assert_eq!(selector(&labels), "migration=mig-1,plan=plan-1,vmID=vm-7");
    }

    #[test]
    fn test_all_but_migration_survives_retried_migrations() {
        let first = OwnershipLabels::new("mig-1", "plan-1");
        let retry = OwnershipLabels::new("mig-2", "plan-1");
        let query = retry.vm_all_but_migration("vm-7");
        assert!(!query.contains_key(LABEL_MIGRATION));
        assert!(matches(Some(&first.vm_labels("vm-7")), &query));
        assert!(!matches(Some(&retry.vm_labels("vm-7")), &first.vm_labels("vm-7")));
    }

    #[test]
    fn test_role_labels_differ_between_pods() {
        let s = scheme();
        let consumer = s.consumer_labels("vm-1", false);
        let conversion = s.conversion_labels("vm-1", true);
        assert_eq!(consumer.get(LABEL_APP).map(String::as_str), Some(ROLE_CONSUMER));
        assert_eq!(conversion.get(LABEL_APP).map(String::as_str), Some(ROLE_CONVERSION));
        assert!(!conversion.contains_key(LABEL_MIGRATION));
        assert!(!matches(Some(&consumer), &conversion));
    }

    #[test]
    fn test_other_vm_never_matches() {
        let s = scheme();
        assert!(!matches(Some(&s.vm_labels("vm-a")), &s.vm_labels("vm-b")));
        assert!(!matches(None, &s.vm_labels("vm-a")));
    }

    #[test]
    fn test_index_groups_by_triple_and_skips_unlabeled() {
        let s = scheme();
        let objs = vec![
            object("a-1", s.vm_labels("vm-a")),
            object("a-2", s.vm_labels("vm-a")),
            object("b-1", s.vm_labels("vm-b")),
            object("stray", s.plan_labels()),
            object("a-old", OwnershipLabels::new("mig-0", "plan-1").vm_labels("vm-a")),
        ];
        let mut index = OwnershipIndex::from_objects(&objs);

        let key = s.key("vm-a");
        assert_eq!(index.names(&key).collect::<Vec<_>>(), vec!["a-1", "a-2"]);
        assert_eq!(index.names_for_vm("plan-1", "vm-a").count(), 3);
        assert_eq!(index.len(), 3);

        index.remove(&key, "a-1");
        index.remove(&key, "a-2");
        assert_eq!(index.names(&key).count(), 0);
        assert_eq!(index.len(), 2);
    }
}
