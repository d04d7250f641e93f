//! Teardown of everything created for a VM
//!
//! Deletion runs in reverse creation order. Every delete is independent: a
//! missing object counts as deleted, and a failure is recorded in the
//! [`TeardownReport`] while the remaining objects are still deleted.

use std::collections::BTreeSet;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolume, PersistentVolumeClaim, Pod, Secret};
use kube::api::ApiResource;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use ferry_common::kubevirt::{DataVolume, VirtualMachine};
use ferry_common::labels::{selector, Labels, LABEL_JOB_NAME};
use ferry_common::plan::VmStatus;
use ferry_common::store::{api_resource, object_ref, Kind};
use ferry_common::{Error, OwnershipIndex, Propagation, Result};

use crate::engine::ConvergenceEngine;

/// Name prefix of the staging claim a populator fills before rebinding
const PRIME_CLAIM_PREFIX: &str = "prime-";
/// Name prefix of populator pods; the suffix is the claim UID
const POPULATOR_POD_PREFIX: &str = "populate-";

/// Outcome of a teardown pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// `Kind namespace/name` of every object deleted by this pass
    pub deleted: Vec<String>,
    /// `Kind namespace/name` and error of every delete that failed
    pub failures: Vec<(String, String)>,
}

impl TeardownReport {
    /// True when no delete failed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// First failure as an error, for callers that fail the step on it
    pub fn into_result(self) -> Result<Vec<String>> {
        match self.failures.into_iter().next() {
            None => Ok(self.deleted),
            Some((object, message)) => Err(Error::internal("teardown", object, "", message)),
        }
    }

    fn record(&mut self, kind: &str, object: String, result: Result<()>) {
        let entry = format!("{} {}", kind, object);
        match result {
            Ok(()) => {
                debug!(object = %entry, "deleted");
                self.deleted.push(entry);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(object = %entry, error = %e, "delete failed");
                self.failures.push((entry, e.to_string()));
            }
        }
    }

    fn list_failed(&mut self, kind: &str, labels: &Labels, err: Error) {
        warn!(kind, selector = %selector(labels), error = %err, "list failed");
        self.failures
            .push((format!("{} {}", kind, selector(labels)), err.to_string()));
    }
}

impl ConvergenceEngine {
    /// Delete every object of the VM in this migration attempt.
    ///
    /// Hook jobs, pods, the VM, the Secret and the ConfigMap are matched
    /// across migrations of the plan, since a retried migration adopts them.
    /// Volumes are matched within this migration.
    ///
    /// Never fails as a whole; see [`TeardownReport::failures`].
    #[instrument(skip_all, fields(vm = %vm.id))]
    pub async fn delete_vm_resources(&self, vm: &VmStatus) -> TeardownReport {
        let mut report = TeardownReport::default();
        let labels = self.labels.vm_labels(&vm.id);
        let any_migration = self.labels.vm_all_but_migration(&vm.id);

        self.delete_hook_jobs(&any_migration, &mut report).await;
        self.delete_labeled::<Pod>(
            Some(self.namespace()),
            &self.labels.conversion_labels(&vm.id, true),
            Propagation::Background,
            &mut report,
        )
        .await;
        self.delete_labeled::<Pod>(
            Some(self.namespace()),
            &self.labels.consumer_labels(&vm.id, true),
            Propagation::Background,
            &mut report,
        )
        .await;
        self.delete_labeled::<VirtualMachine>(
            Some(self.namespace()),
            &any_migration,
            Propagation::Foreground,
            &mut report,
        )
        .await;
        self.delete_data_volumes(&labels, &mut report).await;
        self.delete_populators(vm, &labels, &mut report).await;
        self.delete_claims(vm, &labels, &mut report).await;
        self.delete_labeled::<PersistentVolume>(None, &labels, Propagation::Background, &mut report)
            .await;
        self.delete_labeled::<Secret>(
            Some(self.namespace()),
            &any_migration,
            Propagation::Background,
            &mut report,
        )
        .await;
        self.delete_labeled::<ConfigMap>(
            Some(self.namespace()),
            &any_migration,
            Propagation::Background,
            &mut report,
        )
        .await;

        info!(
            deleted = report.deleted.len(),
            failed = report.failures.len(),
            "teardown finished"
        );
        report
    }

    async fn delete_one<K: Kind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        propagation: Propagation,
        report: &mut TeardownReport,
    ) {
        let result = self.store.delete::<K>(namespace, name, propagation).await;
        report.record(&K::kind(&()), object_ref(namespace, name), result);
    }

    /// Delete every `K` matching `labels`
    async fn delete_labeled<K: Kind>(
        &self,
        namespace: Option<&str>,
        labels: &Labels,
        propagation: Propagation,
        report: &mut TeardownReport,
    ) {
        let objects: Vec<K> = match self.store.list(namespace, labels).await {
            Ok(objects) => objects,
            Err(e) => return report.list_failed(&K::kind(&()), labels, e),
        };
        for obj in objects {
            let Some(name) = obj.meta().name.clone() else {
                continue;
            };
            let ns = obj.meta().namespace.clone();
            self.delete_one::<K>(ns.as_deref(), &name, propagation, report)
                .await;
        }
    }

    /// Hook jobs of the VM and the pods they left behind
    async fn delete_hook_jobs(&self, labels: &Labels, report: &mut TeardownReport) {
        let jobs: Vec<Job> = match self.store.list(Some(self.namespace()), labels).await {
            Ok(jobs) => jobs,
            Err(e) => return report.list_failed("Job", labels, e),
        };
        for job in jobs {
            let Some(name) = job.metadata.name.as_deref() else {
                continue;
            };
            let pods = Labels::from([(LABEL_JOB_NAME.to_string(), name.to_string())]);
            self.delete_labeled::<Pod>(Some(self.namespace()), &pods, Propagation::Background, report)
                .await;
            self.delete_one::<Job>(Some(self.namespace()), name, Propagation::Background, report)
                .await;
        }
    }

    /// DataVolumes are deleted on their own so that a VM that was never
    /// created does not leave them behind. Importer pods go first.
    async fn delete_data_volumes(&self, labels: &Labels, report: &mut TeardownReport) {
        let claims: Vec<PersistentVolumeClaim> =
            match self.store.list(Some(self.namespace()), labels).await {
                Ok(claims) => claims,
                Err(e) => return report.list_failed("PersistentVolumeClaim", labels, e),
            };
        for claim in &claims {
            if let Err(e) = self.delete_importer_pods(claim).await {
                warn!(claim = ?claim.metadata.name, error = %e, "importer pods not deleted");
            }
        }
        self.delete_labeled::<DataVolume>(
            Some(self.namespace()),
            labels,
            Propagation::Background,
            report,
        )
        .await;
    }

    /// Populator pods of the VM's claims and the populator CRs
    async fn delete_populators(&self, vm: &VmStatus, labels: &Labels, report: &mut TeardownReport) {
        let Some(resource) = self.builder.populator_resource() else {
            return;
        };
        let uids: BTreeSet<String> = match self.get_pvcs(vm).await {
            Ok(claims) => claims.into_iter().filter_map(|c| c.metadata.uid).collect(),
            Err(e) => return report.list_failed("PersistentVolumeClaim", labels, e),
        };
        match self.populator_pods().await {
            Ok(pods) => {
                for pod in pods {
                    let Some(name) = pod.metadata.name.as_deref() else {
                        continue;
                    };
                    let owned = name
                        .strip_prefix(POPULATOR_POD_PREFIX)
                        .is_some_and(|uid| uids.contains(uid));
                    if owned {
                        self.delete_one::<Pod>(
                            Some(self.namespace()),
                            name,
                            Propagation::Background,
                            report,
                        )
                        .await;
                    }
                }
            }
            Err(e) => report.list_failed("Pod", labels, e),
        }
        self.delete_populator_crs(&resource, labels, report).await;
    }

    async fn delete_populator_crs(
        &self,
        resource: &ApiResource,
        labels: &Labels,
        report: &mut TeardownReport,
    ) {
        let crs = match self
            .store
            .raw()
            .list(resource, Some(self.namespace().to_string()), labels.clone())
            .await
        {
            Ok(crs) => crs,
            Err(e) => return report.list_failed(&resource.kind, labels, e),
        };
        for cr in crs {
            let Some(name) = cr.metadata.name else {
                continue;
            };
            let result = self
                .store
                .raw()
                .delete(
                    resource,
                    cr.metadata.namespace.clone(),
                    name.clone(),
                    Propagation::Background,
                )
                .await;
            report.record(
                &resource.kind,
                object_ref(cr.metadata.namespace.as_deref(), &name),
                result,
            );
        }
    }

    /// Claims left after the VM is gone.
    ///
    /// Their lifecycle may be driven by a populator, so each one is deleted
    /// and then has its finalizers stripped. The populator's staging claim
    /// goes first.
    async fn delete_claims(&self, vm: &VmStatus, labels: &Labels, report: &mut TeardownReport) {
        let resource = api_resource::<PersistentVolumeClaim>();
        let claims = match self
            .store
            .raw()
            .list(&resource, Some(self.namespace().to_string()), labels.clone())
            .await
        {
            Ok(claims) => claims,
            Err(e) => return report.list_failed("PersistentVolumeClaim", labels, e),
        };
        let mut index = OwnershipIndex::from_objects(claims.iter());
        let key = self.labels.key(&vm.id);
        let names: Vec<String> = index.names(&key).map(str::to_string).collect();

        for name in names {
            let uid = claims
                .iter()
                .find(|c| c.metadata.name.as_deref() == Some(name.as_str()))
                .and_then(|c| c.metadata.uid.clone())
                .filter(|_| self.builder.supports_populators());
            if let Some(uid) = uid {
                self.delete_one::<PersistentVolumeClaim>(
                    Some(self.namespace()),
                    &format!("{}{}", PRIME_CLAIM_PREFIX, uid),
                    Propagation::Background,
                    report,
                )
                .await;
            }
            self.delete_one::<PersistentVolumeClaim>(
                Some(self.namespace()),
                &name,
                Propagation::Background,
                report,
            )
            .await;
            match self
                .store
                .patch_merge::<PersistentVolumeClaim>(
                    Some(self.namespace()),
                    &name,
                    json!({ "metadata": { "finalizers": null } }),
                )
                .await
            {
                Ok(_) => debug!(claim = %name, "finalizers stripped"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(claim = %name, error = %e, "finalizers not stripped");
                    report.failures.push((
                        format!("PersistentVolumeClaim {}", object_ref(Some(self.namespace()), &name)),
                        e.to_string(),
                    ));
                    continue;
                }
            }
            index.remove(&key, &name);
        }
        if index.names(&key).next().is_some() {
            debug!(vm = %vm.id, "claims left behind by failed deletes");
        }
    }
}
