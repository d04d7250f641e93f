//! Ensure operations for the objects every VM import needs
//!
//! Every lookup goes through the VM's ownership labels. Generated names are
//! random, so they are never used to decide whether something exists.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolume, PersistentVolumeClaim, Pod, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ApiResource, DynamicObject, ObjectMeta};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use ferry_common::kubevirt::{DataVolume, DataVolumeSpec};
use ferry_common::labels::{
    Labels, ANN_BIND_IMMEDIATE, ANN_DEFAULT_NETWORK, ANN_DELETE_AFTER_COMPLETION,
    ANN_IMPORTER_POD, ANN_RETAIN_AFTER_COMPLETION, LABEL_MIGRATION, LABEL_TEMPLATE_APP,
    LABEL_VOLUME,
};
use ferry_common::plan::{SourceVm, VmStatus};
use ferry_common::store::object_ref;
use ferry_common::Result;

use crate::conversion::pod;
use crate::engine::ConvergenceEngine;

/// App label of CDI importer pods
const CDI_IMPORTER_APP: &str = "containerized-data-importer";
/// Name prefix of populator pods; the suffix is the claim UID
const POPULATOR_POD_PREFIX: &str = "populate-";
const CLAIM_PENDING: &str = "Pending";

fn claim_owner(claim: &PersistentVolumeClaim) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "PersistentVolumeClaim".to_string(),
        name: claim.metadata.name.clone().unwrap_or_default(),
        uid: claim.metadata.uid.clone().unwrap_or_default(),
        block_owner_deletion: Some(true),
        controller: Some(false),
    }
}

fn volume_label(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(LABEL_VOLUME))
        .map(String::as_str)
}

impl ConvergenceEngine {
    fn vm_meta(&self, vm: &VmStatus, namespaced: bool) -> ObjectMeta {
        ObjectMeta {
            generate_name: Some(self.generated_name(vm)),
            namespace: namespaced.then(|| self.namespace().to_string()),
            labels: Some(self.labels.vm_labels(&vm.id)),
            ..Default::default()
        }
    }

    // =========================================================================
    // Namespace, secret, config payload
    // =========================================================================

    /// Create the target namespace if it does not exist
    pub async fn ensure_namespace(&self) -> Result<()> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace().to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match self.store.create(&namespace).await {
            Ok(_) => {
                info!(namespace = %self.namespace(), "created namespace");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.wrap("Namespace", self.namespace(), "")),
        }
    }

    /// Create or refresh the VM's credential secret.
    ///
    /// An existing secret gets its data replaced so rotated source
    /// credentials propagate.
    #[instrument(skip_all, fields(vm = %vm.id))]
    pub async fn ensure_secret(&self, vm: &VmStatus) -> Result<Secret> {
        let source = self.source_vm(vm).await?;
        let mut desired = Secret {
            metadata: self.vm_meta(vm, true),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        self.builder.secret(&source, &mut desired)?;

        let existing: Vec<Secret> = self
            .store
            .list(Some(self.namespace()), &self.labels.vm_labels(&vm.id))
            .await
            .map_err(|e| self.wrap(e, &desired, vm))?;
        match existing.into_iter().next() {
            Some(mut secret) => {
                secret.string_data = desired.string_data;
                if desired.data.is_some() {
                    secret.data = desired.data;
                }
                let updated = self
                    .store
                    .update(&secret)
                    .await
                    .map_err(|e| self.wrap(e, &secret, vm))?;
                debug!(secret = ?updated.metadata.name, "secret updated");
                Ok(updated)
            }
            None => {
                let created = self.create_generated(&desired, vm).await?;
                info!(secret = ?created.metadata.name, "created secret");
                Ok(created)
            }
        }
    }

    /// Create the VM's config payload if it does not exist. An existing one
    /// is returned as is.
    #[instrument(skip_all, fields(vm = %vm.id))]
    pub async fn ensure_config_map(&self, vm: &VmStatus) -> Result<ConfigMap> {
        let mut desired = ConfigMap {
            metadata: self.vm_meta(vm, true),
            ..Default::default()
        };
        let existing: Vec<ConfigMap> = self
            .store
            .list(Some(self.namespace()), &self.labels.vm_labels(&vm.id))
            .await
            .map_err(|e| self.wrap(e, &desired, vm))?;
        if let Some(config_map) = existing.into_iter().next() {
            return Ok(config_map);
        }
        let source = self.source_vm(vm).await?;
        self.builder.config_map(&source, &mut desired)?;
        let created = self.create_generated(&desired, vm).await?;
        info!(config_map = ?created.metadata.name, "created config map");
        Ok(created)
    }

    // =========================================================================
    // Import volumes
    // =========================================================================

    fn data_volume_template(&self, vm: &VmStatus) -> DataVolume {
        let labels = self.labels.vm_labels(&vm.id);
        let mut annotations = labels.clone();
        if self.settings.retain_precopy_importer_pods {
            annotations.insert(ANN_RETAIN_AFTER_COMPLETION.to_string(), "true".to_string());
        }
        if let Some(network) = &self.plan.transfer_network {
            annotations.insert(ANN_DEFAULT_NETWORK.to_string(), network.to_string());
        }
        if self.plan.warm || !self.plan.destination_is_host {
            annotations.insert(ANN_BIND_IMMEDIATE.to_string(), "true".to_string());
        }
        annotations.insert(ANN_DELETE_AFTER_COMPLETION.to_string(), "false".to_string());
        DataVolume {
            metadata: ObjectMeta {
                generate_name: Some(self.generated_name(vm)),
                namespace: Some(self.namespace().to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: DataVolumeSpec::default(),
            status: None,
        }
    }

    /// Build (but do not create) the import DataVolumes of a VM.
    ///
    /// Ensures the secret and config payload they reference, and the LUN
    /// volumes the VM attaches directly.
    pub async fn data_volumes(&self, vm: &VmStatus) -> Result<Vec<DataVolume>> {
        let source = self.source_vm(vm).await?;
        let secret = self.ensure_secret(vm).await?;
        let config_map = self.ensure_config_map(vm).await?;
        let template = self.data_volume_template(vm);
        let data_volumes = self
            .builder
            .data_volumes(&source, &secret, &config_map, &template)?;
        self.create_lun_disks(vm, &source).await?;
        Ok(data_volumes)
    }

    /// Create each DataVolume whose semantic identity is not yet satisfied
    /// by an existing one. Returns every DataVolume of the VM.
    #[instrument(skip_all, fields(vm = %vm.id, count = data_volumes.len()))]
    pub async fn ensure_data_volumes(
        &self,
        vm: &VmStatus,
        data_volumes: &[DataVolume],
    ) -> Result<Vec<DataVolume>> {
        let mut existing: Vec<DataVolume> = self
            .store
            .list(Some(self.namespace()), &self.labels.vm_labels(&vm.id))
            .await
            .map_err(|e| self.wrap_kind::<DataVolume>(e, &self.generated_name(vm), vm))?;
        let mut satisfied: BTreeSet<String> = existing
            .iter()
            .map(|dv| self.builder.resolve_data_volume_identifier(dv))
            .collect();

        for dv in data_volumes {
            let id = self.builder.resolve_data_volume_identifier(dv);
            if satisfied.contains(&id) {
                debug!(disk = %id, "data volume already exists");
                continue;
            }
            let created = self.create_generated(dv, vm).await?;
            info!(disk = %id, data_volume = ?created.metadata.name, "created data volume");
            satisfied.insert(id);
            existing.push(created);
        }
        Ok(existing)
    }

    // =========================================================================
    // Populator volumes
    // =========================================================================

    /// Create the populator CRs and claims of a VM whose provider fills disks
    /// through a volume populator. Returns every populator claim of the VM.
    #[instrument(skip_all, fields(vm = %vm.id))]
    pub async fn populator_volumes(&self, vm: &VmStatus) -> Result<Vec<PersistentVolumeClaim>> {
        let source = self.source_vm(vm).await?;
        let secret = self.ensure_secret(vm).await?;
        self.create_lun_disks(vm, &source).await?;

        let labels = self.labels.vm_labels(&vm.id);
        let template = PersistentVolumeClaim {
            metadata: ObjectMeta {
                generate_name: Some(self.generated_name(vm)),
                namespace: Some(self.namespace().to_string()),
                labels: Some(labels.clone()),
                annotations: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        let secret_name = secret.metadata.name.clone().unwrap_or_default();
        let volumes = self
            .builder
            .populator_volumes(&source, &template, &secret_name)?;

        let mut claims: Vec<PersistentVolumeClaim> = self
            .store
            .list(Some(self.namespace()), &self.labels.vm_labels(&vm.id))
            .await
            .map_err(|e| self.wrap(e, &template, vm))?;
        let mut satisfied: BTreeSet<String> = claims
            .iter()
            .map(|c| self.builder.resolve_claim_identifier(c))
            .collect();

        for volume in volumes {
            self.create_or_adopt(&volume.resource, volume.populator, vm)
                .await?;
            let id = self.builder.resolve_claim_identifier(&volume.claim);
            if satisfied.contains(&id) {
                debug!(disk = %id, "populator claim already exists");
                continue;
            }
            let created = self.create_generated(&volume.claim, vm).await?;
            info!(disk = %id, claim = ?created.metadata.name, "created populator claim");
            satisfied.insert(id);
            claims.push(created);
        }
        Ok(claims)
    }

    /// Create a fixed-name object, adopting it when it already exists
    async fn create_or_adopt(
        &self,
        resource: &ApiResource,
        obj: DynamicObject,
        vm: &VmStatus,
    ) -> Result<DynamicObject> {
        let namespace = obj.metadata.namespace.clone();
        let name = obj.metadata.name.clone().unwrap_or_default();
        let object = object_ref(namespace.as_deref(), &name);
        match self.store.raw().create(resource, obj).await {
            Ok(created) => {
                info!(kind = %resource.kind, %object, "created");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => self
                .store
                .raw()
                .get(resource, namespace, name)
                .await
                .map_err(|e| e.wrap(&resource.kind, &object, &vm.id)),
            Err(e) => Err(e.wrap(&resource.kind, &object, &vm.id)),
        }
    }

    /// Make sure populator claims still waiting for a consumer get one.
    ///
    /// At most one consumer pod exists per VM; it mounts every pending
    /// claim so that storage with delayed binding provisions them.
    #[instrument(skip_all, fields(vm = %vm.id))]
    pub async fn ensure_populator_volumes(
        &self,
        vm: &VmStatus,
        claims: &[PersistentVolumeClaim],
    ) -> Result<Option<Pod>> {
        let pending: Vec<String> = claims
            .iter()
            .filter(|c| c.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(CLAIM_PENDING))
            .filter_map(|c| c.metadata.name.clone())
            .collect();
        if pending.is_empty() {
            return Ok(None);
        }

        let existing: Vec<Pod> = self
            .store
            .list(
                Some(self.namespace()),
                &self.labels.consumer_labels(&vm.id, true),
            )
            .await
            .map_err(|e| self.wrap_kind::<Pod>(e, &self.generated_name(vm), vm))?;
        if let Some(pod) = existing.into_iter().next() {
            return Ok(Some(pod));
        }

        let mut consumer = pod::consumer_pod(
            self.namespace(),
            format!("{}pvcinit-", self.generated_name(vm)),
            self.labels.consumer_labels(&vm.id, false),
            &self.settings.virt_v2v_image_cold,
            &pending,
        );
        if let Some(spec) = consumer.spec.as_mut() {
            pod::set_kvm(spec, self.plan.provider.provider_type, &self.settings);
        }
        let created = self.create_generated(&consumer, vm).await?;
        info!(pod = ?created.metadata.name, claims = pending.len(), "created consumer pod");
        Ok(Some(created))
    }

    /// Give each populator pod of the VM its claim as owner, so the pod goes
    /// away with the claim
    pub async fn set_populator_pod_ownership(&self, vm: &VmStatus) -> Result<()> {
        let claims = self.get_pvcs(vm).await?;
        let pods = self.populator_pods().await?;
        for claim in &claims {
            let Some(uid) = claim.metadata.uid.as_deref() else {
                continue;
            };
            let pod_name = format!("{}{}", POPULATOR_POD_PREFIX, uid);
            if !pods.iter().any(|p| p.metadata.name.as_deref() == Some(&pod_name)) {
                continue;
            }
            let patch = json!({ "metadata": { "ownerReferences": [claim_owner(claim)] } });
            self.store
                .patch_merge::<Pod>(Some(self.namespace()), &pod_name, patch)
                .await
                .map_err(|e| self.wrap_kind::<Pod>(e, &pod_name, vm))?;
            debug!(pod = %pod_name, claim = ?claim.metadata.name, "populator pod owned by claim");
        }
        Ok(())
    }

    /// Populator pods of this migration attempt
    pub(crate) async fn populator_pods(&self) -> Result<Vec<Pod>> {
        let selector = Labels::from([(
            LABEL_MIGRATION.to_string(),
            self.labels.migration().to_string(),
        )]);
        let pods: Vec<Pod> = self.store.list(Some(self.namespace()), &selector).await?;
        Ok(pods
            .into_iter()
            .filter(|p| {
                p.metadata
                    .name
                    .as_deref()
                    .is_some_and(|n| n.starts_with(POPULATOR_POD_PREFIX))
            })
            .collect())
    }

    // =========================================================================
    // Claims and importer pods
    // =========================================================================

    /// Every claim of the VM in this migration attempt, across namespaces
    pub async fn get_pvcs(&self, vm: &VmStatus) -> Result<Vec<PersistentVolumeClaim>> {
        self.store
            .list(None, &self.labels.migration_vm(&vm.id))
            .await
            .map_err(|e| self.wrap_kind::<PersistentVolumeClaim>(e, &self.generated_name(vm), vm))
    }

    /// The CDI importer pod filling `pvc`, if it is known and still exists
    pub async fn get_importer_pod(&self, pvc: &PersistentVolumeClaim) -> Result<Option<Pod>> {
        let Some(name) = pvc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANN_IMPORTER_POD))
        else {
            return Ok(None);
        };
        self.store
            .find(pvc.metadata.namespace.as_deref(), name)
            .await
    }

    /// Delete the CDI importer pods of `pvc`. Failures are logged and the
    /// remaining pods are still deleted.
    pub async fn delete_importer_pods(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        let has_importer = pvc
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(ANN_IMPORTER_POD));
        if !has_importer {
            return Ok(());
        }
        let claim_name = pvc.metadata.name.clone().unwrap_or_default();
        let namespace = pvc.metadata.namespace.as_deref();
        let selector = Labels::from([(
            LABEL_TEMPLATE_APP.to_string(),
            CDI_IMPORTER_APP.to_string(),
        )]);
        let pods: Vec<Pod> = self.store.list(namespace, &selector).await?;
        let needle = format!("importer-{}", claim_name);
        for pod in pods {
            let Some(name) = pod.metadata.name.as_deref() else {
                continue;
            };
            if !name.contains(&needle) {
                continue;
            }
            match self
                .store
                .delete::<Pod>(namespace, name, ferry_common::Propagation::Background)
                .await
            {
                Ok(()) => debug!(pod = %name, claim = %claim_name, "deleted importer pod"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(pod = %name, error = %e, "failed to delete importer pod"),
            }
        }
        Ok(())
    }

    // =========================================================================
    // LUN disks
    // =========================================================================

    async fn create_lun_disks(&self, vm: &VmStatus, source: &SourceVm) -> Result<()> {
        if source.luns.is_empty() {
            return Ok(());
        }
        let pv_template = PersistentVolume {
            metadata: self.vm_meta(vm, false),
            ..Default::default()
        };
        let volumes = self.builder.lun_persistent_volumes(source, &pv_template)?;
        self.ensure_persistent_volumes(vm, &volumes).await?;

        let pvc_template = PersistentVolumeClaim {
            metadata: self.vm_meta(vm, true),
            ..Default::default()
        };
        let claims = self
            .builder
            .lun_persistent_volume_claims(source, &pvc_template)?;
        self.ensure_persistent_volume_claims(vm, &claims).await?;
        Ok(())
    }

    /// Create the LUN PersistentVolumes not yet present, keyed by their
    /// `volume` label
    pub async fn ensure_persistent_volumes(
        &self,
        vm: &VmStatus,
        volumes: &[PersistentVolume],
    ) -> Result<()> {
        let existing: Vec<PersistentVolume> = self
            .store
            .list(None, &self.labels.vm_labels(&vm.id))
            .await
            .map_err(|e| self.wrap_kind::<PersistentVolume>(e, &self.generated_name(vm), vm))?;
        let present: BTreeSet<&str> = existing
            .iter()
            .filter_map(|pv| volume_label(&pv.metadata))
            .collect();
        for pv in volumes {
            if volume_label(&pv.metadata).is_some_and(|v| present.contains(v)) {
                continue;
            }
            let created = self.create_generated(pv, vm).await?;
            info!(volume = ?volume_label(&created.metadata), pv = ?created.metadata.name, "created persistent volume");
        }
        Ok(())
    }

    /// Create the LUN claims not yet present, keyed by their `volume` label
    pub async fn ensure_persistent_volume_claims(
        &self,
        vm: &VmStatus,
        claims: &[PersistentVolumeClaim],
    ) -> Result<()> {
        let existing: Vec<PersistentVolumeClaim> = self
            .store
            .list(Some(self.namespace()), &self.labels.vm_labels(&vm.id))
            .await
            .map_err(|e| {
                self.wrap_kind::<PersistentVolumeClaim>(e, &self.generated_name(vm), vm)
            })?;
        let present: BTreeSet<&str> = existing
            .iter()
            .filter_map(|c| volume_label(&c.metadata))
            .collect();
        for claim in claims {
            if volume_label(&claim.metadata).is_some_and(|v| present.contains(v)) {
                continue;
            }
            let created = self.create_generated(claim, vm).await?;
            info!(volume = ?volume_label(&created.metadata), claim = ?created.metadata.name, "created lun claim");
        }
        Ok(())
    }
}
