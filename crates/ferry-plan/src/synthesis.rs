//! Target VM synthesis
//!
//! The desired VM comes from the first strategy that succeeds: a matching
//! instancetype preference, then the newest matching OpenShift template,
//! then an empty definition. A failed strategy is logged and the next one
//! tried, so synthesis itself only fails on the provider's hardware
//! overrides.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use kube::api::ObjectMeta;
use tracing::{debug, info, warn};

use ferry_common::kubevirt::{
    PreferenceMatcher, Template, VirtualMachine, VirtualMachineClusterPreference,
    VirtualMachinePreference, VirtualMachineSpec,
};
use ferry_common::labels::{ANN_ORIGINAL_ID, ANN_ORIGINAL_NAME, ANN_VALIDATIONS, LABEL_TEMPLATE_APP};
use ferry_common::plan::{PowerState, ProviderType, SourceVm, VmStatus};
use ferry_common::{Error, Result};

use crate::engine::ConvergenceEngine;
use crate::{naming, template};

const KIND_PREFERENCE: &str = "VirtualMachinePreference";
const KIND_CLUSTER_PREFERENCE: &str = "VirtualMachineClusterPreference";

impl ConvergenceEngine {
    /// Desired VM resource for `vm`, with volumes bound to `claims`.
    ///
    /// Rewrites `vm.name` when it is not a valid DNS-1123 label; the source
    /// name and id are then kept as annotations.
    pub(crate) async fn virtual_machine(
        &self,
        vm: &mut VmStatus,
        claims: &[PersistentVolumeClaim],
    ) -> Result<VirtualMachine> {
        let source = self.source_vm(vm).await?;

        let original_name = naming::rename(&vm.name).map(|renamed| {
            info!(vm = %vm.id, original = %vm.name, renamed = %renamed, "renaming VM to a valid DNS-1123 label");
            std::mem::replace(&mut vm.name, renamed)
        });

        let mut target = match self.vm_from_preference(vm, &source).await {
            Ok(target) => target,
            Err(e) => {
                warn!(vm = %vm.id, error = %e, "building VM without a preference");
                match self.vm_from_template(vm, &source).await {
                    Ok(target) => target,
                    Err(e) => {
                        warn!(vm = %vm.id, error = %e, "building VM without a template");
                        self.empty_vm(vm)
                    }
                }
            }
        };

        target
            .spec
            .template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_TEMPLATE_APP.to_string(), vm.name.clone());

        if let Some(original) = original_name {
            let annotations = target.metadata.annotations.get_or_insert_with(BTreeMap::new);
            annotations.insert(ANN_ORIGINAL_NAME.to_string(), original);
            annotations.insert(ANN_ORIGINAL_ID.to_string(), vm.id.clone());
        }

        target.spec.running = Some(vm.restore_power_state == PowerState::On);
        self.builder
            .virtual_machine(&source, &mut target.spec, claims)?;
        Ok(target)
    }

    fn empty_vm(&self, vm: &VmStatus) -> VirtualMachine {
        let mut target = VirtualMachine::new(&vm.name, VirtualMachineSpec::default());
        target.metadata.namespace = Some(self.namespace().to_string());
        target.metadata.labels = Some(self.labels.vm_labels(&vm.id));
        target
    }

    /// OS map of the source provider, from the operator namespace
    async fn os_map(&self) -> Result<ConfigMap> {
        let name = match self.plan.provider.provider_type {
            ProviderType::VSphere => &self.settings.vsphere_os_config_map,
            ProviderType::OVirt => &self.settings.ovirt_os_config_map,
            ProviderType::OpenStack => return Ok(ConfigMap::default()),
        };
        self.store
            .get(Some(&self.settings.operator_namespace), name)
            .await
    }

    async fn vm_from_preference(&self, vm: &VmStatus, source: &SourceVm) -> Result<VirtualMachine> {
        let os_map = self.os_map().await?;
        let name = self.builder.preference_name(source, &os_map)?;

        let local = self
            .store
            .find::<VirtualMachinePreference>(Some(self.namespace()), &name)
            .await?;
        let kind = if local.is_some() {
            KIND_PREFERENCE
        } else {
            debug!(vm = %vm.id, preference = %name, "no namespaced preference, trying cluster wide");
            self.store
                .get::<VirtualMachineClusterPreference>(None, &name)
                .await?;
            KIND_CLUSTER_PREFERENCE
        };

        let mut target = self.empty_vm(vm);
        target.spec.preference = Some(PreferenceMatcher {
            name,
            kind: Some(kind.to_string()),
        });
        Ok(target)
    }

    /// Newest template matching the guest OS, processed for this VM
    async fn vm_from_template(&self, vm: &VmStatus, source: &SourceVm) -> Result<VirtualMachine> {
        let selector = self.builder.template_labels(source)?;
        let mut templates: Vec<Template> = self
            .store
            .list(Some(&self.settings.template_namespace), &selector)
            .await?;
        templates.sort_by(|a, b| {
            b.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .cmp(&a.metadata.creation_timestamp.as_ref().map(|t| t.0))
        });
        let Some(mut tmpl) = templates.into_iter().next() else {
            return Err(Error::validation_for(
                &vm.id,
                format!("no template matches {:?}", selector),
            ));
        };
        let template_name = tmpl.metadata.name.clone().unwrap_or_default();

        template::process(&mut tmpl, &vm.name)?;
        let object = tmpl.objects.into_iter().next().ok_or_else(|| {
            Error::validation_for(
                &vm.id,
                format!("template {} has no objects", template_name),
            )
        })?;
        let mut target: VirtualMachine = serde_json::from_value(object)
            .map_err(|e| Error::serialization("VirtualMachine", e.to_string()))?;

        target
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(self.labels.vm_labels(&vm.id));
        target.metadata.name = Some(vm.name.clone());
        target.metadata.namespace = Some(self.namespace().to_string());
        target.metadata.owner_references = None;
        if let Some(annotations) = target.metadata.annotations.as_mut() {
            annotations.remove(ANN_VALIDATIONS);
        }
        target.spec.data_volume_templates.clear();
        target.spec.template.spec.volumes.clear();
        target.spec.template.spec.networks.clear();
        target.spec.template.spec.domain.devices.disks.clear();
        target.spec.template.spec.domain.devices.interfaces.clear();
        debug!(vm = %vm.id, template = %template_name, "VM built from template");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::*;
    use ferry_common::store::{api_resource, to_dynamic};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn os_map(h: &Harness, key: &str, value: &str) {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(h.engine.settings.vsphere_os_config_map.clone()),
                namespace: Some(h.engine.settings.operator_namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
            ..Default::default()
        };
        h.store.seed(&api_resource::<ConfigMap>(), to_dynamic(&cm).unwrap());
    }

    fn template(h: &Harness, name: &str, labels: BTreeMap<String, String>, created: i64) {
        let tmpl = json!({
            "apiVersion": "template.openshift.io/v1",
            "kind": "Template",
            "metadata": {
                "name": name,
                "namespace": h.engine.settings.template_namespace,
                "labels": labels,
                "creationTimestamp": Time(Utc.timestamp_opt(created, 0).unwrap()),
            },
            "parameters": [
                { "name": "NAME" },
                { "name": "DATA_SOURCE_NAME", "value": "rhel9" }
            ],
            "objects": [{
                "apiVersion": "kubevirt.io/v1",
                "kind": "VirtualMachine",
                "metadata": {
                    "name": "${NAME}",
                    "annotations": { "vm.kubevirt.io/validations": "[]", "from": name },
                    "labels": { "vm.kubevirt.io/template": name }
                },
                "spec": {
                    "dataVolumeTemplates": [{ "metadata": { "name": "${NAME}" } }],
                    "template": { "spec": {
                        "domain": { "devices": { "disks": [{ "name": "rootdisk" }] } },
                        "networks": [{ "name": "default", "pod": {} }],
                        "volumes": [{ "name": "rootdisk", "dataVolume": { "name": "${NAME}" } }]
                    }}
                }
            }]
        });
        let obj = serde_json::from_value(tmpl).unwrap();
        h.store.seed(&api_resource::<Template>(), obj);
    }

    #[tokio::test]
    async fn test_preference_wins_when_mapped_and_present() {
        let source = source_vm("vm-1", ProviderType::VSphere);
        let h = harness(ProviderType::VSphere, vec![source.clone()]);
        let mut vm = status(&source);
        os_map(&h, "rhel9_64Guest", "rhel.9");
        let pref = VirtualMachineClusterPreference::new("rhel.9", Default::default());
        h.store.seed(
            &api_resource::<VirtualMachineClusterPreference>(),
            to_dynamic(&pref).unwrap(),
        );
        let claims = import_claims(&h, &vm).await;

        let target = h.engine.virtual_machine(&mut vm, &claims).await.unwrap();
        let preference = target.spec.preference.unwrap();
        assert_eq!(preference.name, "rhel.9");
        assert_eq!(preference.kind.as_deref(), Some(KIND_CLUSTER_PREFERENCE));
        assert_eq!(target.spec.template.spec.volumes.len(), 2);
    }

    #[tokio::test]
    async fn test_falls_back_to_newest_matching_template() {
        let source = source_vm("vm-1", ProviderType::VSphere);
        let h = harness(ProviderType::VSphere, vec![source.clone()]);
        let mut vm = status(&source);
        let labels = h.engine.builder().template_labels(&source).unwrap();
        template(&h, "older", labels.clone(), 1_600_000_000);
        template(&h, "newer", labels, 1_700_000_000);
        let claims = import_claims(&h, &vm).await;

        let target = h.engine.virtual_machine(&mut vm, &claims).await.unwrap();
        assert!(target.spec.preference.is_none());
        let annotations = target.metadata.annotations.clone().unwrap_or_default();
        assert_eq!(annotations.get("from").map(String::as_str), Some("newer"));
        assert!(!annotations.contains_key(ANN_VALIDATIONS));
        assert!(target.spec.data_volume_templates.is_empty());
        let volumes = &target.spec.template.spec.volumes;
        assert_eq!(volumes.len(), 2);
        assert!(volumes.iter().all(|v| v.persistent_volume_claim.is_some()));
        let labels = target.metadata.labels.unwrap();
        assert_eq!(labels["vm.kubevirt.io/template"], "newer");
        assert_eq!(labels["vmID"], "vm-1");
    }

    #[tokio::test]
    async fn test_falls_back_to_empty_definition() {
        let source = source_vm("vm-1", ProviderType::VSphere);
        let h = harness(ProviderType::VSphere, vec![source.clone()]);
        let mut vm = status(&source);
        let claims = import_claims(&h, &vm).await;

        let target = h.engine.virtual_machine(&mut vm, &claims).await.unwrap();
        assert!(target.spec.preference.is_none());
        assert_eq!(target.spec.running, Some(true));
        assert_eq!(target.metadata.namespace.as_deref(), Some(NS));
        assert_eq!(
            target.metadata.labels.unwrap(),
            h.engine.labels().vm_labels("vm-1")
        );
        let networks = &target.spec.template.spec.networks;
        assert_eq!(networks.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_names_are_rewritten_and_recorded() {
        let mut source = source_vm("vm-1", ProviderType::VSphere);
        source.name = "My_VM!".to_string();
        let h = harness(ProviderType::VSphere, vec![source.clone()]);
        let mut vm = status(&source);
        let claims = import_claims(&h, &vm).await;

        let target = h.engine.virtual_machine(&mut vm, &claims).await.unwrap();
        assert_eq!(vm.name, "my-vm");
        assert_eq!(target.metadata.name.as_deref(), Some("my-vm"));
        let annotations = target.metadata.annotations.unwrap();
        assert_eq!(annotations[ANN_ORIGINAL_NAME], "My_VM!");
        assert_eq!(annotations[ANN_ORIGINAL_ID], "vm-1");
        let app = &target.spec.template.metadata.unwrap().labels.unwrap()[LABEL_TEMPLATE_APP];
        assert_eq!(app, "my-vm");
    }

    #[tokio::test]
    async fn test_valid_names_are_left_alone() {
        let mut source = source_vm("vm-1", ProviderType::VSphere);
        source.name = "valid-name".to_string();
        source.power_state = PowerState::Off;
        let h = harness(ProviderType::VSphere, vec![source.clone()]);
        let mut vm = status(&source);
        let claims = import_claims(&h, &vm).await;

        let target = h.engine.virtual_machine(&mut vm, &claims).await.unwrap();
        assert_eq!(vm.name, "valid-name");
        assert!(target.metadata.annotations.is_none());
        assert_eq!(target.spec.running, Some(false));
    }
}
