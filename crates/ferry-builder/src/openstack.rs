//! OpenStack builder
//!
//! Disks are filled by the OpenStack volume populator: each claim carries a
//! `dataSourceRef` to an `OpenstackVolumePopulator` that downloads the
//! disk's image. Populator names are derived from the VM and disk ids, so
//! a second pass finds the same CR instead of creating another.

use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Secret, TypedObjectReference,
};
use kube::api::{ApiResource, DynamicObject};
use serde_json::json;

use ferry_common::kubevirt::DataVolume;
use ferry_common::labels::Labels;
use ferry_common::plan::{ProviderDetails, ProviderType, SourceVm};
use ferry_common::store::HasApiResource;
use ferry_common::{Error, Result, NAME_MAX_LENGTH};

use crate::spec::{annotate, claim_spec};
use crate::{common_template_labels, os_map_lookup, BuildContext, Builder, PopulatorVolume, ANN_SOURCE_DISK};

/// Keys copied from the provider secret into the per-VM secret
pub const SECRET_KEYS: &[&str] = &[
    "username",
    "password",
    "projectName",
    "domainName",
    "regionName",
    "cacert",
    "insecureSkipVerify",
];

const OS_DISTROS: &[(&str, &str)] = &[
    ("rhel", "rhel9"),
    ("centos", "centos-stream9"),
    ("fedora", "fedora"),
    ("ubuntu", "ubuntu"),
    ("windows", "win2k19"),
];

/// The OpenStack volume populator CR
pub struct OpenstackVolumePopulator;

impl HasApiResource for OpenstackVolumePopulator {
    const API_VERSION: &'static str = "forklift.konveyor.io/v1beta1";
    const KIND: &'static str = "OpenstackVolumePopulator";
}

/// Builder for OpenStack sources
pub struct OpenStackBuilder {
    ctx: BuildContext,
}

impl OpenStackBuilder {
    /// Builder over `ctx`
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }

    fn os_distro<'a>(&self, vm: &'a SourceVm) -> Result<&'a str> {
        match &vm.details {
            ProviderDetails::OpenStack { os_distro, .. } => Ok(os_distro.as_str()),
            _ => Err(Error::builder(
                ProviderType::OpenStack.to_string(),
                &vm.id,
                "snapshot carries no OpenStack details",
            )),
        }
    }

    fn populator(
        &self,
        ar: &ApiResource,
        name: &str,
        labels: Option<&Labels>,
        image_id: &str,
        secret_name: &str,
    ) -> DynamicObject {
        let mut spec = json!({
            "identityUrl": self.ctx.plan.provider.url,
            "secretName": secret_name,
            "imageId": image_id,
        });
        if let Some(network) = self.ctx.transfer_network() {
            spec["transferNetwork"] = json!(network);
        }
        let mut obj = DynamicObject::new(name, ar)
            .within(&self.ctx.plan.target_namespace)
            .data(json!({ "spec": spec }));
        obj.metadata.labels = labels.cloned();
        obj
    }
}

/// Fixed populator name for a disk of a VM
pub fn populator_name(vm_id: &str, disk_id: &str) -> String {
    let raw = format!("{}-{}", vm_id, disk_id).to_lowercase();
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    name.truncate(NAME_MAX_LENGTH);
    name.trim_matches('-').to_string()
}

impl Builder for OpenStackBuilder {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenStack
    }

    fn secret(&self, vm: &SourceVm, secret: &mut Secret) -> Result<()> {
        let data = secret.string_data.get_or_insert_with(Default::default);
        for key in SECRET_KEYS {
            if let Some(v) = self.ctx.secret_value(key) {
                data.insert(key.to_string(), v);
            }
        }
        for required in ["username", "password"] {
            if !data.contains_key(required) {
                return Err(Error::builder(
                    ProviderType::OpenStack.to_string(),
                    &vm.id,
                    format!("provider secret has no {:?}", required),
                ));
            }
        }
        Ok(())
    }

    fn config_map(&self, _vm: &SourceVm, _config_map: &mut ConfigMap) -> Result<()> {
        Ok(())
    }

    fn data_volumes(
        &self,
        vm: &SourceVm,
        _secret: &Secret,
        _config_map: &ConfigMap,
        _template: &DataVolume,
    ) -> Result<Vec<DataVolume>> {
        Err(Error::builder(
            ProviderType::OpenStack.to_string(),
            &vm.id,
            "disks are filled by volume populators",
        ))
    }

    fn populator_resource(&self) -> Option<ApiResource> {
        Some(OpenstackVolumePopulator::api_resource())
    }

    fn populator_volumes(
        &self,
        vm: &SourceVm,
        template: &PersistentVolumeClaim,
        secret_name: &str,
    ) -> Result<Vec<PopulatorVolume>> {
        let ar = OpenstackVolumePopulator::api_resource();
        vm.disks
            .iter()
            .map(|disk| {
                if disk.backing.is_empty() {
                    return Err(Error::builder(
                        ProviderType::OpenStack.to_string(),
                        &vm.id,
                        format!("disk {} has no image to populate from", disk.id),
                    ));
                }
                let name = populator_name(&vm.id, &disk.id);
                let populator = self.populator(
                    &ar,
                    &name,
                    template.metadata.labels.as_ref(),
                    &disk.backing,
                    secret_name,
                );

                let mut claim = template.clone();
                annotate(&mut claim.metadata.annotations, ANN_SOURCE_DISK, &disk.id);
                let mut spec = claim_spec(disk);
                spec.data_source_ref = Some(TypedObjectReference {
                    api_group: Some(ar.group.clone()),
                    kind: ar.kind.clone(),
                    name: name.clone(),
                    namespace: None,
                });
                claim.spec = Some(spec);

                Ok(PopulatorVolume {
                    claim,
                    populator,
                    resource: ar.clone(),
                })
            })
            .collect()
    }

    fn preference_name(&self, vm: &SourceVm, os_map: &ConfigMap) -> Result<String> {
        os_map_lookup(ProviderType::OpenStack, vm, os_map, self.os_distro(vm)?)
    }

    fn template_labels(&self, vm: &SourceVm) -> Result<Labels> {
        let distro = self.os_distro(vm)?;
        OS_DISTROS
            .iter()
            .find(|(prefix, _)| distro.starts_with(prefix))
            .map(|(_, os)| common_template_labels(os))
            .ok_or_else(|| {
                Error::validation_for_field(
                    &vm.id,
                    "osDistro",
                    format!("no template os known for os_distro {:?}", distro),
                )
            })
    }
}
