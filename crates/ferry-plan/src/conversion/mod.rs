//! Guest conversion coordinator
//!
//! The conversion pod converts the imported disks in place and then serves
//! the converted guest's configuration on its control surface. The
//! coordinator never waits: each pass observes the pod, advances as far as
//! it can and returns.
//!
//! ```text
//! NotCreated -> Created -> RunningNoAddress -> RunningWithAddress
//!            -> ConfigFetched -> ShutdownRequested -> Completed
//! ```

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use ferry_common::kubevirt::{Bootloader, VirtualMachine};
use ferry_common::plan::{Step, VmStatus, SETTING_VDDK_INIT_IMAGE, STEP_IMAGE_CONVERSION};
use ferry_common::Result;

use crate::engine::ConvergenceEngine;
use crate::ovf;

pub mod control;
pub mod domain;
pub(crate) mod pod;

#[cfg(test)]
pub use control::MockConversionControl;
pub use control::{ControlError, ConversionControl, HttpConversionControl, CONFIG_PATH, SHUTDOWN_PATH};
pub use domain::{libvirt_domain, DOMAIN_XML_KEY};

/// Observed progress of a VM's guest conversion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionState {
    /// No conversion pod exists
    NotCreated,
    /// Pod exists but is not running yet
    Created,
    /// Pod is running without an address
    RunningNoAddress,
    /// Pod has an address; its control surface may not be listening yet
    RunningWithAddress,
    /// Converted configuration was read and applied
    ConfigFetched,
    /// The pod was asked to exit
    ShutdownRequested,
    /// The conversion step is complete
    Completed,
}

impl fmt::Display for ConversionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotCreated => "NotCreated",
            Self::Created => "Created",
            Self::RunningNoAddress => "RunningNoAddress",
            Self::RunningWithAddress => "RunningWithAddress",
            Self::ConfigFetched => "ConfigFetched",
            Self::ShutdownRequested => "ShutdownRequested",
            Self::Completed => "Completed",
        };
        write!(f, "{}", s)
    }
}

/// Derive the conversion state from the pod and the conversion step
pub fn conversion_state(pod: Option<&Pod>, step: Option<&Step>) -> ConversionState {
    if step.is_some_and(Step::is_completed) {
        return ConversionState::Completed;
    }
    let Some(pod) = pod else {
        return ConversionState::NotCreated;
    };
    let status = pod.status.as_ref();
    if status.and_then(|s| s.phase.as_deref()) != Some("Running") {
        return ConversionState::Created;
    }
    match status.and_then(|s| s.pod_ip.as_deref()) {
        Some(ip) if !ip.is_empty() => ConversionState::RunningWithAddress,
        _ => ConversionState::RunningNoAddress,
    }
}

fn pod_address(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

impl ConvergenceEngine {
    /// Write the libvirt domain of `target` into the VM's config payload
    pub async fn ensure_libvirt_config_map(
        &self,
        vm: &VmStatus,
        target: &VirtualMachine,
        claims: &[PersistentVolumeClaim],
    ) -> Result<ConfigMap> {
        let mut config_map = self.ensure_config_map(vm).await?;
        let xml = libvirt_domain(target, claims)
            .map_err(|e| self.wrap(e, &config_map, vm))?;
        config_map
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(DOMAIN_XML_KEY.to_string(), xml);
        let updated = self
            .store
            .update(&config_map)
            .await
            .map_err(|e| self.wrap(e, &config_map, vm))?;
        debug!(vm = %vm.id, config_map = ?updated.metadata.name, "libvirt domain updated");
        Ok(updated)
    }

    /// Create the conversion pod unless one already exists for the VM
    #[instrument(skip_all, fields(vm = %vm.id))]
    pub async fn ensure_guest_conversion_pod(
        &self,
        vm: &VmStatus,
        target: &VirtualMachine,
        claims: &[PersistentVolumeClaim],
    ) -> Result<Pod> {
        let secret = self.ensure_secret(vm).await?;
        let config_map = self.ensure_libvirt_config_map(vm, target, claims).await?;

        let existing: Vec<Pod> = self
            .store
            .list(
                Some(self.namespace()),
                &self.labels.conversion_labels(&vm.id, true),
            )
            .await
            .map_err(|e| self.wrap_kind::<Pod>(e, &self.generated_name(vm), vm))?;
        if let Some(pod) = existing.into_iter().next() {
            debug!(pod = ?pod.metadata.name, "conversion pod already exists");
            return Ok(pod);
        }

        let source = self.source_vm(vm).await?;
        let environment = self.builder.pod_environment(&source)?;
        let secret_name = secret.metadata.name.clone().unwrap_or_default();
        let config_map_name = config_map.metadata.name.clone().unwrap_or_default();
        let mut pod = pod::conversion_pod(pod::ConversionPodSpec {
            namespace: self.namespace(),
            generate_name: self.generated_name(vm),
            labels: self.labels.conversion_labels(&vm.id, false),
            transfer_network: self.plan.transfer_network.as_ref().map(ToString::to_string),
            provider: self.plan.provider.provider_type,
            warm: self.plan.warm,
            settings: &self.settings,
            vddk_init_image: self
                .plan
                .provider
                .settings
                .get(SETTING_VDDK_INIT_IMAGE)
                .map(String::as_str),
            secret_name: &secret_name,
            config_map_name: &config_map_name,
            luks_secret: vm.luks.as_deref(),
            environment,
            vm: target,
            claims,
        })
        .map_err(|e| self.wrap_kind::<Pod>(e, &self.generated_name(vm), vm))?;
        if let Some(spec) = pod.spec.as_mut() {
            pod::set_kvm(spec, self.plan.provider.provider_type, &self.settings);
        }

        let created = self.create_generated(&pod, vm).await?;
        info!(pod = ?created.metadata.name, "created conversion pod");
        Ok(created)
    }

    /// The VM's conversion pod in this migration attempt, if any
    pub async fn get_guest_conversion_pod(&self, vm: &VmStatus) -> Result<Option<Pod>> {
        let pods: Vec<Pod> = self
            .store
            .list(
                Some(self.namespace()),
                &self.labels.conversion_labels(&vm.id, false),
            )
            .await
            .map_err(|e| self.wrap_kind::<Pod>(e, &self.generated_name(vm), vm))?;
        Ok(pods.into_iter().next())
    }

    /// Poll the conversion pod and, once it serves the converted
    /// configuration, apply the firmware, shut the pod down and complete the
    /// conversion step.
    ///
    /// A refused connection means the server is not up yet and leaves
    /// everything unchanged. A connection dropped by `/shutdown` counts as a
    /// clean exit.
    #[instrument(skip_all, fields(vm = %vm.id))]
    pub async fn update_vm_by_converted_config(
        &self,
        vm: &mut VmStatus,
        pod: &Pod,
    ) -> Result<ConversionState> {
        let state = conversion_state(Some(pod), vm.step(STEP_IMAGE_CONVERSION));
        if state != ConversionState::RunningWithAddress {
            debug!(%state, "conversion not pollable");
            return Ok(state);
        }
        let Some(address) = pod_address(pod) else {
            return Ok(ConversionState::RunningNoAddress);
        };

        let config = match self.control.fetch_config(address).await {
            Ok(config) => config,
            Err(ControlError::Refused { endpoint }) => {
                debug!(%endpoint, "conversion server not ready");
                return Ok(ConversionState::RunningWithAddress);
            }
            Err(e) => return Err(e.into()),
        };
        let firmware = ovf::firmware_from_config(&config)?;
        vm.firmware = firmware.clone();
        self.patch_vm_firmware(vm, &firmware).await?;
        debug!(state = %ConversionState::ConfigFetched, %firmware);

        match self.control.shutdown(address).await {
            Ok(()) => {}
            Err(ControlError::Closed { endpoint }) => {
                debug!(%endpoint, "conversion server closed the connection on shutdown");
            }
            Err(e) => return Err(e.into()),
        }
        debug!(state = %ConversionState::ShutdownRequested);

        if let Some(step) = vm.step_mut(STEP_IMAGE_CONVERSION) {
            step.mark_completed();
            step.progress.completed = step.progress.total;
        }
        info!(%firmware, "guest conversion completed");
        Ok(ConversionState::Completed)
    }

    /// Set the boot loader of the VM's target resource, if it exists yet
    async fn patch_vm_firmware(&self, vm: &VmStatus, firmware: &str) -> Result<()> {
        let vms: Vec<VirtualMachine> = self
            .store
            .list(
                Some(self.namespace()),
                &self.labels.vm_all_but_migration(&vm.id),
            )
            .await
            .map_err(|e| self.wrap_kind::<VirtualMachine>(e, &vm.name, vm))?;
        let Some(target) = vms.first() else {
            return Ok(());
        };
        let bootloader = Bootloader::for_firmware(firmware);
        let patch = json!({
            "spec": { "template": { "spec": { "domain": { "firmware": { "bootloader": {
                "bios": bootloader.bios.unwrap_or(Value::Null),
                "efi": bootloader.efi.unwrap_or(Value::Null),
            }}}}}}
        });
        let name = target.metadata.name.clone().unwrap_or_default();
        self.store
            .patch_merge::<VirtualMachine>(Some(self.namespace()), &name, patch)
            .await
            .map_err(|e| self.wrap(e, target, vm))?;
        Ok(())
    }
}
