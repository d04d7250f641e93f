//! Per-source-provider translation of source VMs into target fragments
//!
//! A [`Builder`] is a pure adapter: given a source VM snapshot and the
//! objects the engine already built (secret, config map, templates carrying
//! ownership labels), it produces credentials, config payload, volume
//! claims, VM hardware and the semantic identity of each volume. It never
//! touches the store; an error means "cannot proceed now" and the caller
//! decides whether to retry.
//!
//! One implementation exists per source platform. [`builder_for`] picks it
//! once per plan.

#![deny(missing_docs)]

use k8s_openapi::api::core::v1::{
    ConfigMap, EnvVar, PersistentVolume, PersistentVolumeClaim, Secret,
};
use kube::api::{ApiResource, DynamicObject};

use ferry_common::kubevirt::{DataVolume, VirtualMachineSpec};
use ferry_common::labels::Labels;
use ferry_common::plan::{MigrationPlan, ProviderType, SourceDisk, SourceVm};
use ferry_common::{Error, Result, Settings};

pub mod openstack;
pub mod ovirt;
mod spec;
pub mod vsphere;

pub use openstack::OpenStackBuilder;
pub use ovirt::OVirtBuilder;
pub use vsphere::VSphereBuilder;

/// Annotation recording the semantic identity of the source disk a
/// DataVolume or claim was built for. CDI copies it onto the claim.
pub const ANN_SOURCE_DISK: &str = "ferry.konveyor.io/source-disk";

/// Everything a builder may read besides the VM snapshot
#[derive(Clone, Debug)]
pub struct BuildContext {
    /// The plan being executed
    pub plan: MigrationPlan,
    /// Engine settings
    pub settings: Settings,
    /// Credentials of the source provider
    pub source_secret: Secret,
}

impl BuildContext {
    /// Read a key of the provider secret (`stringData` first, then `data`)
    pub fn secret_value(&self, key: &str) -> Option<String> {
        secret_value(&self.source_secret, key)
    }

    /// Transfer network as `namespace/name`
    pub fn transfer_network(&self) -> Option<String> {
        self.plan.transfer_network.as_ref().map(ToString::to_string)
    }
}

/// Read a key of a secret (`stringData` first, then `data`)
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(v) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Some(v.clone());
    }
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| String::from_utf8_lossy(&b.0).into_owned())
}

/// A claim filled by an external populator, plus the populator CR that
/// drives it
#[derive(Clone, Debug)]
pub struct PopulatorVolume {
    /// Claim whose `dataSourceRef` points at `populator`
    pub claim: PersistentVolumeClaim,
    /// Populator custom resource (fixed name)
    pub populator: DynamicObject,
    /// API resource of `populator`
    pub resource: ApiResource,
}

/// Per-provider translation contract
pub trait Builder: Send + Sync {
    /// Platform this builder translates from
    fn provider_type(&self) -> ProviderType;

    /// Fill the per-VM credential secret
    fn secret(&self, vm: &SourceVm, secret: &mut Secret) -> Result<()>;

    /// Fill the per-VM config payload with provider metadata
    fn config_map(&self, vm: &SourceVm, config_map: &mut ConfigMap) -> Result<()>;

    /// One import DataVolume per source disk, cloned from `template`
    fn data_volumes(
        &self,
        vm: &SourceVm,
        secret: &Secret,
        config_map: &ConfigMap,
        template: &DataVolume,
    ) -> Result<Vec<DataVolume>>;

    /// True when disks are filled by a volume populator instead of CDI
    fn supports_populators(&self) -> bool {
        self.populator_resource().is_some()
    }

    /// API resource of the populator CRs this provider creates
    fn populator_resource(&self) -> Option<ApiResource> {
        None
    }

    /// Populator-backed claims, cloned from `template`
    fn populator_volumes(
        &self,
        vm: &SourceVm,
        _template: &PersistentVolumeClaim,
        _secret_name: &str,
    ) -> Result<Vec<PopulatorVolume>> {
        Err(Error::builder(
            self.provider_type().to_string(),
            &vm.id,
            "volume populators are not supported",
        ))
    }

    /// PersistentVolumes for directly attached LUNs
    fn lun_persistent_volumes(
        &self,
        _vm: &SourceVm,
        _template: &PersistentVolume,
    ) -> Result<Vec<PersistentVolume>> {
        Ok(Vec::new())
    }

    /// Claims binding the LUN PersistentVolumes
    fn lun_persistent_volume_claims(
        &self,
        _vm: &SourceVm,
        _template: &PersistentVolumeClaim,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(Vec::new())
    }

    /// Semantic identity of a source disk
    fn disk_identifier(&self, disk: &SourceDisk) -> String {
        disk.id.clone()
    }

    /// Semantic identity of a DataVolume, independent of its generated name
    fn resolve_data_volume_identifier(&self, dv: &DataVolume) -> String {
        dv.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANN_SOURCE_DISK))
            .cloned()
            .unwrap_or_default()
    }

    /// Semantic identity of a claim, independent of its generated name
    fn resolve_claim_identifier(&self, pvc: &PersistentVolumeClaim) -> String {
        pvc.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANN_SOURCE_DISK))
            .cloned()
            .unwrap_or_default()
    }

    /// Apply hardware and volume overrides to the VM spec
    fn virtual_machine(
        &self,
        vm: &SourceVm,
        spec: &mut VirtualMachineSpec,
        claims: &[PersistentVolumeClaim],
    ) -> Result<()> {
        spec::apply_hardware(vm, spec);
        spec::attach_disks(self, vm, spec, claims)?;
        spec::default_network(spec);
        Ok(())
    }

    /// Environment of the guest conversion pod
    fn pod_environment(&self, _vm: &SourceVm) -> Result<Vec<EnvVar>> {
        Ok(Vec::new())
    }

    /// Preference name for the guest OS, looked up in the OS map
    fn preference_name(&self, vm: &SourceVm, os_map: &ConfigMap) -> Result<String>;

    /// Labels selecting a template for the guest OS
    fn template_labels(&self, vm: &SourceVm) -> Result<Labels>;

    /// True when disks must pass through the guest conversion pod
    fn requires_conversion(&self) -> bool {
        false
    }
}

/// Select the builder for the plan's provider
pub fn builder_for(ctx: BuildContext) -> Box<dyn Builder> {
    match ctx.plan.provider.provider_type {
        ProviderType::VSphere => Box::new(VSphereBuilder::new(ctx)),
        ProviderType::OVirt => Box::new(OVirtBuilder::new(ctx)),
        ProviderType::OpenStack => Box::new(OpenStackBuilder::new(ctx)),
    }
}

/// Look up `key` in an OS map config map
pub(crate) fn os_map_lookup(
    provider: ProviderType,
    vm: &SourceVm,
    os_map: &ConfigMap,
    key: &str,
) -> Result<String> {
    os_map
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| {
            Error::validation_for(
                &vm.id,
                format!("no {} preference mapped for guest os {:?}", provider, key),
            )
        })
}

/// Template labels for a KubeVirt common-templates OS name
pub(crate) fn common_template_labels(os: &str) -> Labels {
    Labels::from([
        (format!("os.template.kubevirt.io/{}", os), "true".to_string()),
        ("workload.template.kubevirt.io/server".to_string(), "true".to_string()),
        ("flavor.template.kubevirt.io/medium".to_string(), "true".to_string()),
    ])
}
