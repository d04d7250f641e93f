//! oVirt builder
//!
//! Disks are imported by CDI over imageio. Directly attached iSCSI LUNs are
//! not copied: each gets a PersistentVolume pointing at the same target and
//! a claim bound to it through the `volume` label.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ISCSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, Secret, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde_json::json;

use ferry_common::kubevirt::DataVolume;
use ferry_common::labels::{Labels, LABEL_VM, LABEL_VOLUME};
use ferry_common::plan::{ProviderDetails, ProviderType, SourceLun, SourceVm};
use ferry_common::{Error, Result};

use crate::spec::{annotate, storage};
use crate::{common_template_labels, os_map_lookup, BuildContext, Builder, ANN_SOURCE_DISK};

/// Key of the CA bundle in the per-VM config map
pub const CA_CERT_KEY: &str = "ca.pem";

const OS_TYPES: &[(&str, &str)] = &[
    ("rhel_9", "rhel9"),
    ("rhel_8", "rhel8"),
    ("rhel_7", "rhel7"),
    ("windows_2022", "win2k22"),
    ("windows_2019", "win2k19"),
    ("windows_2016", "win2k16"),
    ("windows_11", "win11"),
    ("windows_10", "win10"),
];

/// Builder for oVirt sources
pub struct OVirtBuilder {
    ctx: BuildContext,
}

impl OVirtBuilder {
    /// Builder over `ctx`
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }

    fn os_type<'a>(&self, vm: &'a SourceVm) -> Result<&'a str> {
        match &vm.details {
            ProviderDetails::OVirt { os_type, .. } => Ok(os_type.as_str()),
            _ => Err(Error::builder(
                ProviderType::OVirt.to_string(),
                &vm.id,
                "snapshot carries no oVirt details",
            )),
        }
    }

    fn lun_labels(template: Option<&Labels>, lun: &SourceLun) -> Labels {
        let mut labels = template.cloned().unwrap_or_default();
        labels.insert(LABEL_VOLUME.to_string(), lun.id.clone());
        labels
    }
}

impl Builder for OVirtBuilder {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OVirt
    }

    fn secret(&self, vm: &SourceVm, secret: &mut Secret) -> Result<()> {
        let missing = |key: &str| {
            Error::builder(
                ProviderType::OVirt.to_string(),
                &vm.id,
                format!("provider secret has no {:?}", key),
            )
        };
        let user = self.ctx.secret_value("user").ok_or_else(|| missing("user"))?;
        let password = self
            .ctx
            .secret_value("password")
            .ok_or_else(|| missing("password"))?;
        let data = secret.string_data.get_or_insert_with(Default::default);
        data.insert("accessKeyId".to_string(), user);
        data.insert("secretKey".to_string(), password);
        Ok(())
    }

    fn config_map(&self, _vm: &SourceVm, config_map: &mut ConfigMap) -> Result<()> {
        if let Some(ca) = self.ctx.secret_value("cacert") {
            config_map
                .data
                .get_or_insert_with(BTreeMap::new)
                .insert(CA_CERT_KEY.to_string(), ca);
        }
        Ok(())
    }

    fn data_volumes(
        &self,
        vm: &SourceVm,
        secret: &Secret,
        config_map: &ConfigMap,
        template: &DataVolume,
    ) -> Result<Vec<DataVolume>> {
        let secret_name = secret.metadata.name.clone().unwrap_or_default();
        let cm_name = config_map.metadata.name.clone().unwrap_or_default();
        Ok(vm
            .disks
            .iter()
            .map(|disk| {
                let mut dv = template.clone();
                annotate(&mut dv.metadata.annotations, ANN_SOURCE_DISK, &disk.id);
                dv.spec.source = Some(json!({
                    "imageio": {
                        "url": self.ctx.plan.provider.url,
                        "diskId": disk.id,
                        "secretRef": secret_name,
                        "certConfigMap": cm_name,
                    }
                }));
                dv.spec.storage = Some(storage(disk));
                dv
            })
            .collect())
    }

    fn resolve_data_volume_identifier(&self, dv: &DataVolume) -> String {
        dv.spec
            .source
            .as_ref()
            .and_then(|s| s.pointer("/imageio/diskId"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                dv.metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANN_SOURCE_DISK))
                    .cloned()
            })
            .unwrap_or_default()
    }

    fn lun_persistent_volumes(
        &self,
        vm: &SourceVm,
        template: &PersistentVolume,
    ) -> Result<Vec<PersistentVolume>> {
        Ok(vm
            .luns
            .iter()
            .map(|lun| {
                let mut pv = template.clone();
                pv.metadata.labels = Some(Self::lun_labels(template.metadata.labels.as_ref(), lun));
                pv.spec = Some(PersistentVolumeSpec {
                    access_modes: Some(vec!["ReadWriteMany".to_string()]),
                    capacity: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(lun.capacity.to_string()),
                    )])),
                    iscsi: Some(ISCSIPersistentVolumeSource {
                        target_portal: lun.target_portal.clone(),
                        iqn: lun.iqn.clone(),
                        lun: lun.lun,
                        read_only: Some(false),
                        ..Default::default()
                    }),
                    persistent_volume_reclaim_policy: Some("Retain".to_string()),
                    storage_class_name: Some(String::new()),
                    volume_mode: Some("Block".to_string()),
                    ..Default::default()
                });
                pv
            })
            .collect())
    }

    fn lun_persistent_volume_claims(
        &self,
        vm: &SourceVm,
        template: &PersistentVolumeClaim,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(vm
            .luns
            .iter()
            .map(|lun| {
                let mut pvc = template.clone();
                pvc.metadata.labels =
                    Some(Self::lun_labels(template.metadata.labels.as_ref(), lun));
                pvc.spec = Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteMany".to_string()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(lun.capacity.to_string()),
                        )])),
                        ..Default::default()
                    }),
                    selector: Some(LabelSelector {
                        match_labels: Some(BTreeMap::from([
                            (LABEL_VOLUME.to_string(), lun.id.clone()),
                            (LABEL_VM.to_string(), vm.id.clone()),
                        ])),
                        ..Default::default()
                    }),
                    storage_class_name: Some(String::new()),
                    volume_mode: Some("Block".to_string()),
                    ..Default::default()
                });
                pvc
            })
            .collect())
    }

    fn preference_name(&self, vm: &SourceVm, os_map: &ConfigMap) -> Result<String> {
        os_map_lookup(ProviderType::OVirt, vm, os_map, self.os_type(vm)?)
    }

    fn template_labels(&self, vm: &SourceVm) -> Result<Labels> {
        let os_type = self.os_type(vm)?;
        OS_TYPES
            .iter()
            .find(|(prefix, _)| os_type.starts_with(prefix))
            .map(|(_, os)| common_template_labels(os))
            .ok_or_else(|| {
                Error::validation_for_field(
                    &vm.id,
                    "osType",
                    format!("no template os known for os type {:?}", os_type),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use kube::api::ObjectMeta;

    fn ovirt_vm() -> SourceVm {
        let mut vm = vm(ProviderDetails::OVirt {
            cluster: "Default".to_string(),
            os_type: "rhel_8x64".to_string(),
        });
        vm.luns.push(SourceLun {
            id: "lun-a".to_string(),
            capacity: 1 << 30,
            target_portal: "10.0.0.5:3260".to_string(),
            iqn: "iqn.2024-01.com.example:storage".to_string(),
            lun: 3,
        });
        vm
    }

    fn vm_template_labels() -> Labels {
        Labels::from([(LABEL_VM.to_string(), "vm-1".to_string())])
    }

    #[test]
    fn test_data_volumes_import_over_imageio() {
        let builder = OVirtBuilder::new(context(ProviderType::OVirt));
        let mut secret = Secret::default();
        secret.metadata.name = Some("s".to_string());
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("cm".to_string());
        let dvs = builder
            .data_volumes(&ovirt_vm(), &secret, &cm, &DataVolume::new("", Default::default()))
            .unwrap();
        let imageio = &dvs[1].spec.source.as_ref().unwrap()["imageio"];
        assert_eq!(imageio["diskId"], "disk-1");
        assert_eq!(imageio["certConfigMap"], "cm");
        assert_eq!(builder.resolve_data_volume_identifier(&dvs[1]), "disk-1");
    }

    #[test]
    fn test_config_map_carries_the_ca_bundle() {
        let builder = OVirtBuilder::new(context(ProviderType::OVirt));
        let mut cm = ConfigMap::default();
        builder.config_map(&ovirt_vm(), &mut cm).unwrap();
        assert_eq!(cm.data.unwrap()[CA_CERT_KEY], "PEM");
    }

    #[test]
    fn test_luns_become_iscsi_volumes_bound_by_label() {
        let builder = OVirtBuilder::new(context(ProviderType::OVirt));
        let vm = ovirt_vm();
        let pv_template = PersistentVolume {
            metadata: ObjectMeta {
                labels: Some(vm_template_labels()),
                ..Default::default()
            },
            ..Default::default()
        };
        let pvs = builder.lun_persistent_volumes(&vm, &pv_template).unwrap();
        assert_eq!(pvs.len(), 1);
        let labels = pvs[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_VOLUME], "lun-a");
        assert_eq!(labels[LABEL_VM], "vm-1");
        let iscsi = pvs[0].spec.as_ref().unwrap().iscsi.as_ref().unwrap();
        assert_eq!((iscsi.lun, iscsi.target_portal.as_str()), (3, "10.0.0.5:3260"));

        let claims = builder
            .lun_persistent_volume_claims(&vm, &PersistentVolumeClaim::default())
            .unwrap();
        let selector = claims[0].spec.as_ref().unwrap().selector.as_ref().unwrap();
        assert_eq!(selector.match_labels.as_ref().unwrap()[LABEL_VOLUME], "lun-a");
    }

    #[test]
    fn test_template_labels_follow_os_type() {
        let builder = OVirtBuilder::new(context(ProviderType::OVirt));
        let labels = builder.template_labels(&ovirt_vm()).unwrap();
        assert!(labels.contains_key("os.template.kubevirt.io/rhel8"));

        let mut other = ovirt_vm();
        other.details = ProviderDetails::OVirt {
            cluster: "Default".to_string(),
            os_type: "other_linux".to_string(),
        };
        assert!(builder.template_labels(&other).is_err());
    }

    #[test]
    fn test_populators_are_not_supported() {
        let builder = OVirtBuilder::new(context(ProviderType::OVirt));
        assert!(!builder.supports_populators());
        let err = builder
            .populator_volumes(&ovirt_vm(), &PersistentVolumeClaim::default(), "s")
            .unwrap_err();
        assert!(matches!(err, Error::Builder { .. }));
    }
}
