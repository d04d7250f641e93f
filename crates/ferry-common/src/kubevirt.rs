//! Target resource types: KubeVirt VMs, CDI DataVolumes, instancetype
//! preferences and OpenShift templates
//!
//! Only the fields the engine reads or writes are modeled. Everything else
//! is preserved through `#[serde(flatten)]` maps so objects round-trip
//! without losing operator edits.

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Condition reported by KubeVirt and CDI resources
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last transition time (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

// =============================================================================
// VirtualMachine (kubevirt.io/v1)
// =============================================================================

/// Desired state of a KubeVirt VirtualMachine
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    namespaced,
    status = "VirtualMachineStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Start the VM once created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    /// Instancetype preference reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<PreferenceMatcher>,
    /// DataVolumes created alongside the VM
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volume_templates: Vec<Value>,
    /// VMI template
    #[serde(default)]
    pub template: VmiTemplate,
    /// Fields not modeled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Observed state of a VirtualMachine
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// VM conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Human-readable state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printable_status: Option<String>,
    /// Fields not modeled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reference to a (cluster) VirtualMachinePreference
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PreferenceMatcher {
    /// Preference name
    pub name: String,
    /// `VirtualMachinePreference` or `VirtualMachineClusterPreference`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Template for the VM's instances
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VmiTemplate {
    /// Instance metadata (labels, annotations)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    /// Instance spec
    #[serde(default)]
    pub spec: VmiSpec,
}

/// Instance spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmiSpec {
    /// Virtual hardware
    #[serde(default)]
    pub domain: DomainSpec,
    /// Volumes backing the domain's disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Networks backing the domain's interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Value>,
    /// Fields not modeled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Virtual hardware
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// CPU topology
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
    /// Guest memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
    /// Resource requests/limits of the VM pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<DomainResources>,
    /// Firmware and boot loader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,
    /// Devices
    #[serde(default)]
    pub devices: Devices,
    /// Fields not modeled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// CPU topology
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Cpu {
    /// Sockets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
    /// Cores per socket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// Threads per core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    /// Fields not modeled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Guest memory
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    /// Memory visible to the guest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<Quantity>,
}

/// Resource requests and limits
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DomainResources {
    /// Requests
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, Quantity>,
    /// Limits
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, Quantity>,
}

/// Firmware settings
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Firmware {
    /// Boot loader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<Bootloader>,
    /// Fields not modeled here (serial, uuid)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Boot loader; exactly one of the two is set
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootloader {
    /// Legacy BIOS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bios: Option<Value>,
    /// UEFI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi: Option<Value>,
}

impl Bootloader {
    /// Boot loader for a firmware name (`"efi"` → UEFI, anything else BIOS)
    pub fn for_firmware(firmware: &str) -> Self {
        if firmware == "efi" {
            Self {
                bios: None,
                efi: Some(serde_json::json!({ "secureBoot": false })),
            }
        } else {
            Self {
                bios: Some(serde_json::json!({})),
                efi: None,
            }
        }
    }
}

/// Devices
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Devices {
    /// Disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
    /// Network interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Value>,
    /// Fields not modeled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Disk device
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Name of the backing volume
    pub name: String,
    /// Boot order (1 = first)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<u32>,
    /// Fields not modeled here (disk/lun/cdrom target)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Volume backing a disk
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name, referenced by a disk
    pub name: String,
    /// Backing claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<ClaimVolumeSource>,
    /// Backing DataVolume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeSource>,
    /// Fields not modeled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Volume {
    /// Name of the claim behind this volume, if any
    pub fn claim_name(&self) -> Option<&str> {
        self.persistent_volume_claim
            .as_ref()
            .map(|c| c.claim_name.as_str())
            .or_else(|| self.data_volume.as_ref().map(|d| d.name.as_str()))
    }
}

/// Claim reference
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVolumeSource {
    /// Claim name
    pub claim_name: String,
}

/// DataVolume reference
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DataVolumeSource {
    /// DataVolume name
    pub name: String,
}

impl VirtualMachine {
    /// Owner reference making this VM a (non-controller) owner that blocks
    /// deletion of the dependent until the VM is gone
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: "kubevirt.io/v1".to_string(),
            kind: "VirtualMachine".to_string(),
            name: self.metadata.name.clone().unwrap_or_default(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            block_owner_deletion: Some(true),
            controller: Some(false),
        }
    }

    /// Volumes declared by the VM's template
    pub fn volumes(&self) -> &[Volume] {
        &self.spec.template.spec.volumes
    }

    /// True when the VM mounts the claim backing `dv`
    pub fn owns(&self, dv: &DataVolume) -> bool {
        let name = dv.metadata.name.as_deref();
        self.volumes()
            .iter()
            .any(|v| v.persistent_volume_claim.as_ref().map(|c| c.claim_name.as_str()) == name)
    }

    /// Reported conditions
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

// =============================================================================
// DataVolume (cdi.kubevirt.io/v1beta1)
// =============================================================================

/// Desired state of a CDI DataVolume
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "DataVolume",
    namespaced,
    status = "DataVolumeStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    /// Import source (`vddk`, `imageio`, `blank`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    /// Storage request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Value>,
    /// Fields not modeled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Observed state of a DataVolume
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    /// Pending, ImportScheduled, ImportInProgress, Succeeded, Failed, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Transfer progress (`"45.5%"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    /// Name of the claim backing the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// Preferences (instancetype.kubevirt.io/v1beta1)
// =============================================================================

/// Namespaced VM preference
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "instancetype.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachinePreference",
    namespaced,
    schema = "disabled"
)]
pub struct VirtualMachinePreferenceSpec {
    /// Preference body (not interpreted)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Cluster-scoped VM preference
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "instancetype.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineClusterPreference",
    schema = "disabled"
)]
pub struct VirtualMachineClusterPreferenceSpec {
    /// Preference body (not interpreted)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

// =============================================================================
// Template (template.openshift.io/v1)
// =============================================================================

/// OpenShift template: parameterized objects
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Template {
    /// Standard metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Embedded objects; the first is the VM definition
    #[serde(default)]
    pub objects: Vec<Value>,
    /// Parameters substituted into the objects
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    /// Labels applied to every produced object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// One template parameter
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TemplateParameter {
    /// Parameter name (`NAME`)
    pub name: String,
    /// Explicit value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// `"expression"` when `from` is a generator expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<String>,
    /// Generator expression (`[a-z0-9]{8}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Whether a value is mandatory
    #[serde(default)]
    pub required: bool,
}

impl kube::Resource for Template {
    type DynamicType = ();
    type Scope = kube::core::NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "Template".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "template.openshift.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "templates".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vm_round_trip_preserves_unmodeled_fields() {
        let raw = json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachine",
            "metadata": { "name": "web", "namespace": "target" },
            "spec": {
                "runStrategy": "Always",
                "template": {
                    "spec": {
                        "domain": {
                            "cpu": { "sockets": 2, "cores": 4, "model": "host-model" },
                            "devices": { "disks": [{ "name": "d0", "disk": { "bus": "virtio" } }] }
                        },
                        "volumes": [{ "name": "d0", "persistentVolumeClaim": { "claimName": "pvc-0" } }],
                        "terminationGracePeriodSeconds": 180
                    }
                }
            }
        });
        let vm: VirtualMachine = serde_json::from_value(raw).unwrap();
        let cpu = vm.spec.template.spec.domain.cpu.as_ref().unwrap();
        assert_eq!((cpu.sockets, cpu.cores), (Some(2), Some(4)));
        assert_eq!(vm.volumes()[0].claim_name(), Some("pvc-0"));

        let back = serde_json::to_value(&vm).unwrap();
        assert_eq!(back["spec"]["runStrategy"], "Always");
        assert_eq!(back["spec"]["template"]["spec"]["terminationGracePeriodSeconds"], 180);
        assert_eq!(back["spec"]["template"]["spec"]["domain"]["cpu"]["model"], "host-model");
        assert_eq!(
            back["spec"]["template"]["spec"]["domain"]["devices"]["disks"][0]["disk"]["bus"],
            "virtio"
        );
    }

    #[test]
    fn test_owns_matches_on_claim_name() {
        let mut vm = VirtualMachine::new("web", VirtualMachineSpec::default());
        vm.spec.template.spec.volumes.push(Volume {
            name: "vol-0".to_string(),
            persistent_volume_claim: Some(ClaimVolumeSource {
                claim_name: "plan-vm-1-abcde".to_string(),
            }),
            ..Default::default()
        });
        let mine = DataVolume::new("plan-vm-1-abcde", DataVolumeSpec::default());
        let other = DataVolume::new("plan-vm-2-fghij", DataVolumeSpec::default());
        assert!(vm.owns(&mine));
        assert!(!vm.owns(&other));
    }

    #[test]
    fn test_owner_reference_blocks_deletion_without_controlling() {
        let mut vm = VirtualMachine::new("web", VirtualMachineSpec::default());
        vm.metadata.uid = Some("uid-1".to_string());
        let owner = vm.owner_reference();
        assert_eq!(owner.block_owner_deletion, Some(true));
        assert_eq!(owner.controller, Some(false));
        assert_eq!(owner.uid, "uid-1");
    }

    #[test]
    fn test_bootloader_selection() {
        assert!(Bootloader::for_firmware("efi").efi.is_some());
        assert!(Bootloader::for_firmware("bios").bios.is_some());
        assert!(Bootloader::for_firmware("").efi.is_none());
    }
}
