//! VM hardware, disk and storage fragments shared by every provider

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::{json, Map, Value};

use ferry_common::kubevirt::{
    Bootloader, ClaimVolumeSource, Cpu, Disk, Firmware, Memory, VirtualMachineSpec, Volume,
};
use ferry_common::labels::LABEL_VOLUME;
use ferry_common::plan::{SourceDisk, SourceVm};
use ferry_common::{Error, Result};

use crate::Builder;

const POD_NETWORK: &str = "default";

/// CPU topology, guest memory and boot loader from the source snapshot
pub(crate) fn apply_hardware(vm: &SourceVm, spec: &mut VirtualMachineSpec) {
    let domain = &mut spec.template.spec.domain;
    let cpu = domain.cpu.get_or_insert_with(Cpu::default);
    cpu.sockets = Some(vm.cpu_sockets.max(1));
    cpu.cores = Some(vm.cpu_cores.max(1));
    domain.memory = Some(Memory {
        guest: Some(Quantity(format!("{}Mi", vm.memory_mib))),
    });
    let firmware = domain.firmware.get_or_insert_with(Firmware::default);
    firmware.bootloader = Some(Bootloader::for_firmware(&vm.firmware));
}

/// One disk and volume per source disk and LUN, backed by the claim built
/// for it. The first bootable disk (or the first disk) boots first.
pub(crate) fn attach_disks<B: Builder + ?Sized>(
    builder: &B,
    vm: &SourceVm,
    spec: &mut VirtualMachineSpec,
    claims: &[PersistentVolumeClaim],
) -> Result<()> {
    let boot = vm.disks.iter().position(|d| d.bootable).unwrap_or(0);
    let mut disks = Vec::new();
    let mut volumes = Vec::new();

    for (i, disk) in vm.disks.iter().enumerate() {
        let id = builder.disk_identifier(disk);
        let claim = claims
            .iter()
            .find(|c| builder.resolve_claim_identifier(c) == id)
            .ok_or_else(|| {
                Error::builder(
                    builder.provider_type().to_string(),
                    &vm.id,
                    format!("no claim found for disk {}", id),
                )
            })?;
        let name = format!("vol-{}", i);
        volumes.push(claim_volume(&name, claim)?);
        let mut extra = Map::new();
        extra.insert("disk".to_string(), json!({ "bus": "virtio" }));
        disks.push(Disk {
            name,
            boot_order: (i == boot).then_some(1),
            extra,
        });
    }

    for (i, lun) in vm.luns.iter().enumerate() {
        let claim = claims
            .iter()
            .find(|c| {
                c.metadata.labels.as_ref().and_then(|l| l.get(LABEL_VOLUME)) == Some(&lun.id)
            })
            .ok_or_else(|| {
                Error::builder(
                    builder.provider_type().to_string(),
                    &vm.id,
                    format!("no claim found for lun {}", lun.id),
                )
            })?;
        let name = format!("lun-{}", i);
        volumes.push(claim_volume(&name, claim)?);
        let mut extra = Map::new();
        extra.insert("lun".to_string(), json!({}));
        disks.push(Disk {
            name,
            boot_order: None,
            extra,
        });
    }

    spec.template.spec.domain.devices.disks = disks;
    spec.template.spec.volumes = volumes;
    Ok(())
}

fn claim_volume(name: &str, claim: &PersistentVolumeClaim) -> Result<Volume> {
    let claim_name = claim
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::validation("claim has no name"))?;
    Ok(Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(ClaimVolumeSource { claim_name }),
        ..Default::default()
    })
}

/// Attach the pod network when the VM has no network yet
pub(crate) fn default_network(spec: &mut VirtualMachineSpec) {
    let vmi = &mut spec.template.spec;
    if !vmi.networks.is_empty() {
        return;
    }
    vmi.networks.push(json!({ "name": POD_NETWORK, "pod": {} }));
    vmi.domain
        .devices
        .interfaces
        .push(json!({ "name": POD_NETWORK, "masquerade": {}, "model": "virtio" }));
}

/// CDI `storage` stanza for a source disk
pub(crate) fn storage(disk: &SourceDisk) -> Value {
    let mut storage = Map::new();
    storage.insert(
        "resources".to_string(),
        json!({ "requests": { "storage": disk.capacity.to_string() } }),
    );
    if let Some(class) = &disk.storage_class {
        storage.insert("storageClassName".to_string(), json!(class));
    }
    if let Some(mode) = &disk.volume_mode {
        storage.insert("volumeMode".to_string(), json!(mode));
    }
    if let Some(access) = &disk.access_mode {
        storage.insert("accessModes".to_string(), json!([access]));
    }
    Value::Object(storage)
}

/// Claim spec for a source disk
pub(crate) fn claim_spec(disk: &SourceDisk) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec![disk
            .access_mode
            .clone()
            .unwrap_or_else(|| "ReadWriteOnce".to_string())]),
        storage_class_name: disk.storage_class.clone(),
        volume_mode: disk.volume_mode.clone(),
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(disk.capacity.to_string()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Add an annotation to an optional annotation map
pub(crate) fn annotate(
    annotations: &mut Option<BTreeMap<String, String>>,
    key: &str,
    value: impl Into<String>,
) {
    annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use crate::{OVirtBuilder, ANN_SOURCE_DISK};
    use ferry_common::plan::{ProviderDetails, ProviderType};
    use kube::api::ObjectMeta;

    fn claim(name: &str, identity: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    ANN_SOURCE_DISK.to_string(),
                    identity.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn ovirt_vm() -> SourceVm {
        vm(ProviderDetails::OVirt {
            cluster: "c".to_string(),
            os_type: "rhel_9x64".to_string(),
        })
    }

    #[test]
    fn test_disks_follow_source_order_regardless_of_claim_order() {
        let builder = OVirtBuilder::new(context(ProviderType::OVirt));
        let vm = ovirt_vm();
        let claims = vec![claim("pvc-b", "disk-1"), claim("pvc-a", "disk-0")];
        let mut spec = VirtualMachineSpec::default();
        builder.virtual_machine(&vm, &mut spec, &claims).unwrap();

        let vols: Vec<_> = spec.template.spec.volumes.iter().map(|v| v.claim_name()).collect();
        assert_eq!(vols, vec![Some("pvc-a"), Some("pvc-b")]);
        let disks = &spec.template.spec.domain.devices.disks;
        assert_eq!(disks[0].boot_order, Some(1));
        assert_eq!(disks[1].boot_order, None);
        assert_eq!(disks[0].extra["disk"]["bus"], "virtio");
    }

    #[test]
    fn test_hardware_comes_from_the_snapshot() {
        let builder = OVirtBuilder::new(context(ProviderType::OVirt));
        let vm = ovirt_vm();
        let claims = vec![claim("a", "disk-0"), claim("b", "disk-1")];
        let mut spec = VirtualMachineSpec::default();
        builder.virtual_machine(&vm, &mut spec, &claims).unwrap();

        let domain = &spec.template.spec.domain;
        let cpu = domain.cpu.as_ref().unwrap();
        assert_eq!((cpu.sockets, cpu.cores), (Some(2), Some(2)));
        assert_eq!(domain.memory.as_ref().unwrap().guest, Some(Quantity("4096Mi".to_string())));
        assert!(domain.firmware.as_ref().unwrap().bootloader.as_ref().unwrap().efi.is_some());
        assert_eq!(spec.template.spec.networks.len(), 1);
    }

    #[test]
    fn test_missing_claim_is_a_builder_error() {
        let builder = OVirtBuilder::new(context(ProviderType::OVirt));
        let mut spec = VirtualMachineSpec::default();
        let err = builder
            .virtual_machine(&ovirt_vm(), &mut spec, &[claim("a", "disk-0")])
            .unwrap_err();
        assert!(matches!(err, Error::Builder { .. }), "{err}");
    }

    #[test]
    fn test_existing_networks_are_kept() {
        let mut spec = VirtualMachineSpec::default();
        spec.template.spec.networks.push(json!({ "name": "blue", "multus": {} }));
        default_network(&mut spec);
        assert_eq!(spec.template.spec.networks.len(), 1);
        assert!(spec.template.spec.domain.devices.interfaces.is_empty());
    }

    #[test]
    fn test_storage_carries_optional_fields_only_when_set() {
        let mut d = disk("d", "b");
        d.storage_class = None;
        let s = storage(&d);
        assert!(s.get("storageClassName").is_none());
        assert_eq!(s["resources"]["requests"]["storage"], "10737418240");
        assert_eq!(s["accessModes"][0], "ReadWriteOnce");
    }
}
