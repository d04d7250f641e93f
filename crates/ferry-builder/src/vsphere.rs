//! vSphere builder
//!
//! Disks are imported by CDI: warm plans pull through VDDK, cold plans get
//! blank volumes that the guest conversion pod fills. A disk's identity is
//! its vmdk backing path with any snapshot delta suffix removed, so the same
//! disk is recognized before and after a precopy snapshot.

use k8s_openapi::api::core::v1::{ConfigMap, EnvVar, Secret};
use serde_json::json;
use tracing::debug;

use ferry_common::kubevirt::DataVolume;
use ferry_common::labels::Labels;
use ferry_common::plan::{
    ProviderDetails, ProviderType, SourceDisk, SourceVm, SETTING_VDDK_INIT_IMAGE,
};
use ferry_common::{Error, Result};

use crate::spec::{annotate, storage};
use crate::{common_template_labels, os_map_lookup, BuildContext, Builder, ANN_SOURCE_DISK};

/// Guest id prefixes mapped to KubeVirt common-template OS names
const GUEST_OS: &[(&str, &str)] = &[
    ("rhel9", "rhel9"),
    ("rhel8", "rhel8"),
    ("rhel7", "rhel7"),
    ("centos9", "centos-stream9"),
    ("centos8", "centos-stream8"),
    ("centos7", "centos7"),
    ("fedora", "fedora"),
    ("ubuntu", "ubuntu"),
    ("windows2022srv", "win2k22"),
    ("windows2019srv", "win2k19"),
    ("windows9Server", "win2k16"),
    ("windows11", "win11"),
    ("windows9", "win10"),
];

/// Builder for vSphere sources
pub struct VSphereBuilder {
    ctx: BuildContext,
}

impl VSphereBuilder {
    /// Builder over `ctx`
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }

    fn details<'a>(&self, vm: &'a SourceVm) -> Result<(&'a str, &'a str, &'a str)> {
        match &vm.details {
            ProviderDetails::VSphere {
                uuid,
                host,
                guest_id,
            } => Ok((uuid.as_str(), host.as_str(), guest_id.as_str())),
            _ => Err(Error::builder(
                ProviderType::VSphere.to_string(),
                &vm.id,
                "snapshot carries no vSphere details",
            )),
        }
    }

    fn credential(&self, vm: &SourceVm, key: &str) -> Result<String> {
        self.ctx.secret_value(key).ok_or_else(|| {
            Error::builder(
                ProviderType::VSphere.to_string(),
                &vm.id,
                format!("provider secret has no {:?}", key),
            )
        })
    }

    fn libvirt_url(&self, vm: &SourceVm, host: &str) -> Result<String> {
        let user = self.credential(vm, "user")?.replace('@', "%40");
        let server = endpoint_host(&self.ctx.plan.provider.url);
        Ok(format!("vpx://{}@{}/{}?no_verify=1", user, server, host))
    }
}

impl Builder for VSphereBuilder {
    fn provider_type(&self) -> ProviderType {
        ProviderType::VSphere
    }

    fn secret(&self, vm: &SourceVm, secret: &mut Secret) -> Result<()> {
        let data = secret.string_data.get_or_insert_with(Default::default);
        data.insert("accessKeyId".to_string(), self.credential(vm, "user")?);
        data.insert("secretKey".to_string(), self.credential(vm, "password")?);
        if let Some(thumbprint) = self.ctx.secret_value("thumbprint") {
            data.insert("thumbprint".to_string(), thumbprint);
        }
        if let Some(cacert) = self.ctx.secret_value("cacert") {
            data.insert("cacert".to_string(), cacert);
        }
        Ok(())
    }

    fn config_map(&self, _vm: &SourceVm, _config_map: &mut ConfigMap) -> Result<()> {
        // Filled later with the libvirt domain for the conversion pod.
        Ok(())
    }

    fn data_volumes(
        &self,
        vm: &SourceVm,
        secret: &Secret,
        _config_map: &ConfigMap,
        template: &DataVolume,
    ) -> Result<Vec<DataVolume>> {
        let (uuid, _, _) = self.details(vm)?;
        let secret_name = secret.metadata.name.clone().unwrap_or_default();
        let thumbprint = self.ctx.secret_value("thumbprint").unwrap_or_default();
        let init_image = self
            .ctx
            .plan
            .provider
            .settings
            .get(SETTING_VDDK_INIT_IMAGE)
            .cloned();

        vm.disks
            .iter()
            .map(|disk| {
                let mut dv = template.clone();
                annotate(&mut dv.metadata.annotations, ANN_SOURCE_DISK, self.disk_identifier(disk));
                dv.spec.source = Some(if self.ctx.plan.warm {
                    let mut vddk = json!({
                        "backingFile": disk.backing,
                        "url": self.ctx.plan.provider.url,
                        "uuid": uuid,
                        "thumbprint": thumbprint,
                        "secretRef": secret_name,
                    });
                    if let Some(image) = &init_image {
                        vddk["initImageURL"] = json!(image);
                    }
                    json!({ "vddk": vddk })
                } else {
                    json!({ "blank": {} })
                });
                dv.spec.storage = Some(storage(disk));
                Ok(dv)
            })
            .collect()
    }

    fn disk_identifier(&self, disk: &SourceDisk) -> String {
        trim_snapshot_suffix(&disk.backing)
    }

    fn resolve_data_volume_identifier(&self, dv: &DataVolume) -> String {
        let id = dv
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANN_SOURCE_DISK))
            .cloned()
            .unwrap_or_default();
        trim_snapshot_suffix(&id)
    }

    fn pod_environment(&self, vm: &SourceVm) -> Result<Vec<EnvVar>> {
        let (_, host, _) = self.details(vm)?;
        let mut env = vec![
            env_var("V2V_vmName", &vm.name),
            env_var("V2V_source", "vCenter"),
            env_var("V2V_libvirtURL", &self.libvirt_url(vm, host)?),
        ];
        if let Some(thumbprint) = self.ctx.secret_value("thumbprint") {
            env.push(env_var("V2V_fingerprint", &thumbprint));
        }
        Ok(env)
    }

    fn preference_name(&self, vm: &SourceVm, os_map: &ConfigMap) -> Result<String> {
        let (_, _, guest_id) = self.details(vm)?;
        os_map_lookup(ProviderType::VSphere, vm, os_map, guest_id)
    }

    fn template_labels(&self, vm: &SourceVm) -> Result<Labels> {
        let (_, _, guest_id) = self.details(vm)?;
        let os = GUEST_OS
            .iter()
            .find(|(prefix, _)| guest_id.starts_with(prefix))
            .map(|(_, os)| *os)
            .ok_or_else(|| {
                Error::validation_for_field(
                    &vm.id,
                    "guestId",
                    format!("no template os known for guest id {:?}", guest_id),
                )
            })?;
        debug!(vm = %vm.id, guest_id, os, "template os");
        Ok(common_template_labels(os))
    }

    fn requires_conversion(&self) -> bool {
        true
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Host part of an endpoint URL
fn endpoint_host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    rest.split('/').next().unwrap_or(rest)
}

/// `[ds] vm/disk-000012.vmdk` → `[ds] vm/disk.vmdk`
pub fn trim_snapshot_suffix(backing: &str) -> String {
    let Some(stem) = backing.strip_suffix(".vmdk") else {
        return backing.to_string();
    };
    match stem.rsplit_once('-') {
        Some((base, delta)) if delta.len() == 6 && delta.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{}.vmdk", base)
        }
        _ => backing.to_string(),
    }
}
