//! Migration plan, source VM snapshots and per-VM status
//!
//! These are the engine's read-only inputs (plan, provider, source VM
//! snapshot) and the one piece of state it writes back into (the VM's
//! pipeline steps).

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Name of the pipeline step driven by the guest conversion pod
pub const STEP_IMAGE_CONVERSION: &str = "ImageConversion";

/// Provider setting naming the VDDK init image
pub const SETTING_VDDK_INIT_IMAGE: &str = "vddkInitImage";

/// Source virtualization platform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// VMware vSphere
    VSphere,
    /// oVirt / RHV
    OVirt,
    /// OpenStack
    OpenStack,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VSphere => write!(f, "vsphere"),
            Self::OVirt => write!(f, "ovirt"),
            Self::OpenStack => write!(f, "openstack"),
        }
    }
}

/// `namespace/name` reference
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Source provider the plan migrates from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceProvider {
    /// Provider name
    pub name: String,
    /// Platform
    pub provider_type: ProviderType,
    /// API endpoint
    pub url: String,
    /// Free-form provider settings (e.g. [`SETTING_VDDK_INIT_IMAGE`])
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// A migration plan, immutable while a migration is active
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    /// Plan name (prefix of generated names)
    pub name: String,
    /// Plan UID (ownership label)
    pub uid: String,
    /// Namespace objects are created in
    pub target_namespace: String,
    /// Network used for disk transfer, if not the pod network
    #[serde(default)]
    pub transfer_network: Option<ObjectRef>,
    /// Warm (precopy) migration
    #[serde(default)]
    pub warm: bool,
    /// Source provider
    pub provider: SourceProvider,
    /// True when the destination is the cluster the engine runs in
    #[serde(default = "default_true")]
    pub destination_is_host: bool,
}

fn default_true() -> bool {
    true
}

/// One migration attempt of a plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRef {
    /// Migration UID (ownership label)
    pub uid: String,
    /// Migration name
    pub name: String,
}

/// Power state of a source VM
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    /// Running
    On,
    /// Stopped
    Off,
    /// Not reported
    #[default]
    Unknown,
}

/// A disk of the source VM
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDisk {
    /// Provider disk id
    pub id: String,
    /// Provider-specific backing identity (vmdk path, image id, volume id)
    pub backing: String,
    /// Capacity in bytes
    pub capacity: i64,
    /// Target storage class (from the plan's storage map)
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Target volume mode (`Filesystem` or `Block`)
    #[serde(default)]
    pub volume_mode: Option<String>,
    /// Target access mode
    #[serde(default)]
    pub access_mode: Option<String>,
    /// Disk is bootable
    #[serde(default)]
    pub bootable: bool,
}

/// A directly attached LUN of the source VM
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLun {
    /// Provider disk id
    pub id: String,
    /// Size in bytes
    pub capacity: i64,
    /// iSCSI portal (`10.0.0.5:3260`)
    pub target_portal: String,
    /// iSCSI qualified name
    pub iqn: String,
    /// Logical unit number
    pub lun: i32,
}

/// Provider-specific details of a source VM
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderDetails {
    /// vSphere
    VSphere {
        /// BIOS UUID
        uuid: String,
        /// ESXi host
        host: String,
        /// Guest OS id reported by VMware tools
        guest_id: String,
    },
    /// oVirt
    OVirt {
        /// Cluster
        cluster: String,
        /// Guest OS type
        os_type: String,
    },
    /// OpenStack
    OpenStack {
        /// Flavor
        flavor: String,
        /// `os_distro` image property
        os_distro: String,
        /// Source image, for image-backed instances
        #[serde(default)]
        image_id: Option<String>,
    },
}

/// Read-only snapshot of a source VM
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceVm {
    /// Provider VM id
    pub id: String,
    /// Current display name
    pub name: String,
    /// Name at the time the plan was created
    #[serde(default)]
    pub original_name: Option<String>,
    /// Power state
    #[serde(default)]
    pub power_state: PowerState,
    /// `bios` or `efi`
    #[serde(default)]
    pub firmware: String,
    /// CPU sockets
    pub cpu_sockets: u32,
    /// Cores per socket
    pub cpu_cores: u32,
    /// Memory in MiB
    pub memory_mib: i64,
    /// Disks
    #[serde(default)]
    pub disks: Vec<SourceDisk>,
    /// Directly attached LUNs
    #[serde(default)]
    pub luns: Vec<SourceLun>,
    /// Provider-specific details
    pub details: ProviderDetails,
}

/// Progress of a pipeline step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Units done
    pub completed: i64,
    /// Units total
    pub total: i64,
}

/// One step of a VM's migration pipeline
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Step name
    pub name: String,
    /// Progress
    pub progress: Progress,
    /// Set once when the step starts
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    /// Set once when the step completes
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    /// Last error, if the step failed
    #[serde(default)]
    pub error: Option<String>,
}

impl Step {
    /// New step with `total` units of work
    pub fn new(name: impl Into<String>, total: i64) -> Self {
        Self {
            name: name.into(),
            progress: Progress { completed: 0, total },
            ..Default::default()
        }
    }

    /// Mark started (idempotent)
    pub fn mark_started(&mut self) {
        self.started.get_or_insert_with(Utc::now);
    }

    /// Mark completed (idempotent)
    pub fn mark_completed(&mut self) {
        self.mark_started();
        self.completed.get_or_insert_with(Utc::now);
    }

    /// True once completed
    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }
}

/// Per-VM migration status
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    /// Source VM id
    pub id: String,
    /// Target VM name (possibly rewritten)
    pub name: String,
    /// Power state to restore after the import
    #[serde(default)]
    pub restore_power_state: PowerState,
    /// Firmware, updated from the converted guest
    #[serde(default)]
    pub firmware: String,
    /// Disk encryption secret name
    #[serde(default)]
    pub luks: Option<String>,
    /// Pipeline steps
    #[serde(default)]
    pub pipeline: Vec<Step>,
}

impl VmStatus {
    /// Status for a VM about to be migrated
    pub fn new(vm: &SourceVm) -> Self {
        Self {
            id: vm.id.clone(),
            name: vm.name.clone(),
            restore_power_state: vm.power_state,
            firmware: vm.firmware.clone(),
            luks: None,
            pipeline: Vec::new(),
        }
    }

    /// Find a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.pipeline.iter().find(|s| s.name == name)
    }

    /// Find a step by name, mutably
    pub fn step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.pipeline.iter_mut().find(|s| s.name == name)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id:{} name:'{}'", self.id, self.name)
    }
}

/// Read-only source inventory
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Fetch the current snapshot of a source VM
    async fn vm(&self, id: &str) -> Result<SourceVm>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_completed_is_idempotent() {
        let mut step = Step::new(STEP_IMAGE_CONVERSION, 100);
        assert!(!step.is_completed());
        step.mark_completed();
        let first = step.completed;
        step.mark_completed();
        assert_eq!(step.completed, first);
        assert!(step.started.is_some());
    }

    #[test]
    fn test_status_step_lookup() {
        let mut status = VmStatus {
            id: "vm-1".to_string(),
            pipeline: vec![Step::new("DiskTransfer", 10), Step::new(STEP_IMAGE_CONVERSION, 1)],
            ..Default::default()
        };
        assert!(status.step("Missing").is_none());
        if let Some(step) = status.step_mut(STEP_IMAGE_CONVERSION) {
            step.mark_completed();
        }
        assert!(status.step(STEP_IMAGE_CONVERSION).unwrap().is_completed());
        assert!(!status.step("DiskTransfer").unwrap().is_completed());
    }

    #[test]
    fn test_provider_type_serializes_lowercase() {
        assert_eq!(serde_json::to_value(ProviderType::OpenStack).unwrap(), "openstack");
        assert_eq!(ProviderType::VSphere.to_string(), "vsphere");
    }
}
