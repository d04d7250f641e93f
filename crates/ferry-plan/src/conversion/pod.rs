//! Pod shapes for the guest conversion task and the populator consumer

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvFromSource,
    EnvVar, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext,
    PodSpec, ResourceRequirements, SeccompProfile, SecretEnvSource, SecretVolumeSource,
    SecurityContext, Volume, VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use ferry_common::kubevirt::VirtualMachine;
use ferry_common::labels::{Labels, ANN_DEFAULT_NETWORK};
use ferry_common::plan::ProviderType;
use ferry_common::{Error, Result, Settings};

use super::domain::{block_device_path, disk_mount_path, is_block};

/// qemu user and group inside the conversion image
pub const QEMU_USER: i64 = 107;

const CONVERSION_CONTAINER: &str = "virt-v2v";
const CONSUMER_CONTAINER: &str = "main";
const VDDK_INIT_CONTAINER: &str = "vddk-side-car";
const METRICS_PORT: i32 = 2112;
const SECRET_ENV_PREFIX: &str = "V2V_";

const DOMAIN_VOLUME: &str = "libvirt-domain-xml";
const DOMAIN_MOUNT_PATH: &str = "/mnt/v2v";
const VDDK_VOLUME: &str = "vddk-vol-mount";
const VDDK_MOUNT_PATH: &str = "/opt";
const SECRET_VOLUME: &str = "secret-volume";
const SECRET_MOUNT_PATH: &str = "/etc/secret";
const LUKS_VOLUME: &str = "luks";
const LUKS_MOUNT_PATH: &str = "/etc/luks";

const KVM_DEVICE: &str = "devices.kubevirt.io/kvm";
const SCHEDULABLE_LABEL: &str = "kubevirt.io/schedulable";

/// Inputs of the conversion pod
pub(crate) struct ConversionPodSpec<'a> {
    pub namespace: &'a str,
    pub generate_name: String,
    pub labels: Labels,
    pub transfer_network: Option<String>,
    pub provider: ProviderType,
    pub warm: bool,
    pub settings: &'a Settings,
    pub vddk_init_image: Option<&'a str>,
    pub secret_name: &'a str,
    pub config_map_name: &'a str,
    pub luks_secret: Option<&'a str>,
    pub environment: Vec<EnvVar>,
    pub vm: &'a VirtualMachine,
    pub claims: &'a [PersistentVolumeClaim],
}

fn drop_all() -> Option<Capabilities> {
    Some(Capabilities {
        drop: Some(vec!["ALL".to_string()]),
        ..Default::default()
    })
}

fn runtime_default_seccomp() -> Option<SeccompProfile> {
    Some(SeccompProfile {
        type_: "RuntimeDefault".to_string(),
        ..Default::default()
    })
}

fn unprivileged() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: drop_all(),
        ..Default::default()
    }
}

/// Ask for `/dev/kvm` so the conversion appliance does not run emulated.
/// Only vSphere guests go through the appliance.
pub(crate) fn set_kvm(spec: &mut PodSpec, provider: ProviderType, settings: &Settings) {
    if settings.virt_v2v_dont_request_kvm || provider != ProviderType::VSphere {
        return;
    }
    spec.node_selector
        .get_or_insert_with(BTreeMap::new)
        .insert(SCHEDULABLE_LABEL.to_string(), "true".to_string());
    let Some(container) = spec.containers.first_mut() else {
        return;
    };
    let resources = container
        .resources
        .get_or_insert_with(ResourceRequirements::default);
    for list in [&mut resources.limits, &mut resources.requests] {
        list.get_or_insert_with(BTreeMap::new)
            .insert(KVM_DEVICE.to_string(), Quantity("1".to_string()));
    }
}

/// Volumes, mounts and devices exposing the VM's disks to the conversion
/// pod. Disk `i` follows the VM's volume order.
fn disk_volumes(
    vm: &VirtualMachine,
    claims: &[PersistentVolumeClaim],
) -> Result<(Vec<Volume>, Vec<VolumeMount>, Vec<VolumeDevice>)> {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    let mut devices = Vec::new();
    for (i, vm_volume) in vm.volumes().iter().enumerate() {
        let claim_name = vm_volume.claim_name().unwrap_or_default();
        let claim = claims
            .iter()
            .find(|c| c.metadata.name.as_deref() == Some(claim_name))
            .ok_or_else(|| Error::not_found("PersistentVolumeClaim", claim_name.to_string()))?;
        volumes.push(Volume {
            name: claim_name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                read_only: Some(false),
            }),
            ..Default::default()
        });
        if is_block(claim) {
            devices.push(VolumeDevice {
                name: claim_name.to_string(),
                device_path: block_device_path(i),
            });
        } else {
            mounts.push(VolumeMount {
                name: claim_name.to_string(),
                mount_path: disk_mount_path(i),
                ..Default::default()
            });
        }
    }
    Ok((volumes, mounts, devices))
}

/// The virt-v2v pod converting the VM's disks in place
pub(crate) fn conversion_pod(spec: ConversionPodSpec<'_>) -> Result<Pod> {
    let (mut volumes, mut mounts, devices) = disk_volumes(spec.vm, spec.claims)?;

    volumes.push(Volume {
        name: DOMAIN_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: spec.config_map_name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });
    volumes.push(Volume {
        name: VDDK_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
    if spec.provider == ProviderType::VSphere {
        mounts.push(VolumeMount {
            name: DOMAIN_VOLUME.to_string(),
            mount_path: DOMAIN_MOUNT_PATH.to_string(),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: VDDK_VOLUME.to_string(),
            mount_path: VDDK_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }
    if let Some(luks) = spec.luks_secret {
        volumes.push(Volume {
            name: LUKS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(luks.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: LUKS_VOLUME.to_string(),
            mount_path: LUKS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let image = if spec.warm {
        spec.settings.virt_v2v_image_warm.clone()
    } else {
        volumes.push(Volume {
            name: SECRET_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(spec.secret_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: SECRET_VOLUME.to_string(),
            mount_path: SECRET_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        spec.settings.virt_v2v_image_cold.clone()
    };

    let init_containers = spec.vddk_init_image.map(|image| {
        vec![Container {
            name: VDDK_INIT_CONTAINER.to_string(),
            image: Some(image.to_string()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            volume_mounts: Some(vec![VolumeMount {
                name: VDDK_VOLUME.to_string(),
                mount_path: VDDK_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            security_context: Some(unprivileged()),
            ..Default::default()
        }]
    });

    let annotations = spec
        .transfer_network
        .map(|net| BTreeMap::from([(ANN_DEFAULT_NETWORK.to_string(), net)]));

    Ok(Pod {
        metadata: ObjectMeta {
            namespace: Some(spec.namespace.to_string()),
            generate_name: Some(spec.generate_name),
            labels: Some(spec.labels),
            annotations,
            ..Default::default()
        },
        spec: Some(PodSpec {
            security_context: Some(PodSecurityContext {
                fs_group: Some(QEMU_USER),
                run_as_user: Some(QEMU_USER),
                run_as_non_root: Some(true),
                seccomp_profile: runtime_default_seccomp(),
                ..Default::default()
            }),
            restart_policy: Some("Never".to_string()),
            init_containers,
            containers: vec![Container {
                name: CONVERSION_CONTAINER.to_string(),
                image: Some(image),
                env: Some(spec.environment),
                env_from: Some(vec![EnvFromSource {
                    prefix: Some(SECRET_ENV_PREFIX.to_string()),
                    secret_ref: Some(SecretEnvSource {
                        name: spec.secret_name.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ports: Some(vec![ContainerPort {
                    name: Some("metrics".to_string()),
                    container_port: METRICS_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                volume_mounts: Some(mounts),
                volume_devices: Some(devices),
                security_context: Some(unprivileged()),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// A pod mounting the populator claims so that WaitForFirstConsumer storage
/// binds them
pub(crate) fn consumer_pod(
    namespace: &str,
    generate_name: String,
    labels: Labels,
    image: &str,
    claim_names: &[String],
) -> Pod {
    let volumes = claim_names
        .iter()
        .map(|name| Volume {
            name: name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            generate_name: Some(generate_name),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: CONSUMER_CONTAINER.to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["/bin/sh".to_string()]),
                security_context: Some(SecurityContext {
                    allow_privilege_escalation: Some(false),
                    run_as_non_root: Some(true),
                    run_as_user: Some(QEMU_USER),
                    capabilities: drop_all(),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            volumes: Some(volumes),
            security_context: Some(PodSecurityContext {
                seccomp_profile: runtime_default_seccomp(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
