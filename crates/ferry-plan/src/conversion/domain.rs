//! Minimal libvirt domain handed to the conversion pod
//!
//! virt-v2v only needs the guest's name, memory, CPU topology and where each
//! disk can be found inside the pod. Disk `i` is the VM's `i`-th volume,
//! exposed as `/dev/block<i>` for block claims or as
//! `/mnt/disks/disk<i>/disk.img` otherwise.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde::Serialize;

use ferry_common::kubevirt::VirtualMachine;
use ferry_common::{Error, Result};

/// Key of the domain XML in the config payload
pub const DOMAIN_XML_KEY: &str = "input.xml";

#[derive(Serialize)]
#[serde(rename = "domain")]
struct Domain {
    #[serde(rename = "@type")]
    kind: &'static str,
    name: String,
    memory: DomainMemory,
    cpu: DomainCpu,
    os: DomainOs,
    devices: DomainDevices,
}

#[derive(Serialize)]
struct DomainMemory {
    #[serde(rename = "@unit")]
    unit: &'static str,
    #[serde(rename = "$text")]
    value: u64,
}

#[derive(Serialize)]
struct DomainCpu {
    topology: CpuTopology,
}

#[derive(Serialize)]
struct CpuTopology {
    #[serde(rename = "@sockets")]
    sockets: u32,
    #[serde(rename = "@cores")]
    cores: u32,
    #[serde(rename = "@threads")]
    threads: u32,
}

#[derive(Serialize)]
struct DomainOs {
    #[serde(rename = "type")]
    os_type: OsType,
    boot: Boot,
}

#[derive(Serialize)]
struct OsType {
    #[serde(rename = "$text")]
    value: &'static str,
}

#[derive(Serialize)]
struct Boot {
    #[serde(rename = "@dev")]
    dev: &'static str,
}

#[derive(Serialize)]
struct DomainDevices {
    disk: Vec<DomainDisk>,
}

#[derive(Serialize)]
struct DomainDisk {
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@device")]
    device: &'static str,
    driver: DiskDriver,
    source: DiskSource,
    target: DiskTarget,
}

#[derive(Serialize)]
struct DiskDriver {
    #[serde(rename = "@name")]
    name: &'static str,
    #[serde(rename = "@type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct DiskSource {
    #[serde(rename = "@dev", skip_serializing_if = "Option::is_none")]
    dev: Option<String>,
    #[serde(rename = "@file", skip_serializing_if = "Option::is_none")]
    file: Option<String>,
}

#[derive(Serialize)]
struct DiskTarget {
    #[serde(rename = "@dev")]
    dev: String,
    #[serde(rename = "@bus")]
    bus: &'static str,
}

/// True when the claim is a raw block device
pub fn is_block(claim: &PersistentVolumeClaim) -> bool {
    claim.spec.as_ref().and_then(|s| s.volume_mode.as_deref()) == Some("Block")
}

/// Device path of the `i`-th block disk inside the conversion pod
pub fn block_device_path(i: usize) -> String {
    format!("/dev/block{}", i)
}

/// Mount path of the `i`-th filesystem disk inside the conversion pod
pub fn disk_mount_path(i: usize) -> String {
    format!("/mnt/disks/disk{}", i)
}

/// `hda`, `hdb`, ... `hdz`, `hdaa`, ...
fn disk_target(i: usize) -> String {
    let mut suffix = Vec::new();
    let mut n = i;
    loop {
        suffix.push(b'a' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    suffix.reverse();
    format!("hd{}", String::from_utf8_lossy(&suffix))
}

/// Parse a Kubernetes memory quantity into bytes
pub fn quantity_bytes(q: &str) -> Option<u64> {
    const SUFFIXES: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let q = q.trim();
    for (suffix, factor) in SUFFIXES {
        if let Some(n) = q.strip_suffix(suffix) {
            return n.parse::<u64>().ok().map(|n| n * factor);
        }
    }
    q.parse().ok()
}

fn memory_bytes(vm: &VirtualMachine) -> u64 {
    let domain = &vm.spec.template.spec.domain;
    domain
        .memory
        .as_ref()
        .and_then(|m| m.guest.as_ref())
        .or_else(|| {
            domain
                .resources
                .as_ref()
                .and_then(|r| r.requests.get("memory"))
        })
        .and_then(|q| quantity_bytes(&q.0))
        .unwrap_or_default()
}

/// Render the domain XML for `vm`, whose volumes are backed by `claims`
pub fn libvirt_domain(vm: &VirtualMachine, claims: &[PersistentVolumeClaim]) -> Result<String> {
    let name = vm.metadata.name.clone().unwrap_or_default();
    let disks = vm
        .volumes()
        .iter()
        .enumerate()
        .map(|(i, volume)| {
            let claim_name = volume.claim_name().unwrap_or_default();
            let claim = claims
                .iter()
                .find(|c| c.metadata.name.as_deref() == Some(claim_name))
                .ok_or_else(|| {
                    Error::not_found("PersistentVolumeClaim", claim_name.to_string())
                })?;
            let (kind, source) = if is_block(claim) {
                (
                    "block",
                    DiskSource {
                        dev: Some(block_device_path(i)),
                        file: None,
                    },
                )
            } else {
                (
                    "file",
                    DiskSource {
                        dev: None,
                        file: Some(format!("{}/disk.img", disk_mount_path(i))),
                    },
                )
            };
            Ok(DomainDisk {
                kind,
                device: "disk",
                driver: DiskDriver {
                    name: "qemu",
                    kind: "raw",
                },
                source,
                target: DiskTarget {
                    dev: disk_target(i),
                    bus: "virtio",
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let cpu = vm.spec.template.spec.domain.cpu.as_ref();
    let domain = Domain {
        kind: "kvm",
        name,
        memory: DomainMemory {
            unit: "KiB",
            value: memory_bytes(vm) / 1024,
        },
        cpu: DomainCpu {
            topology: CpuTopology {
                sockets: cpu.and_then(|c| c.sockets).unwrap_or(1),
                cores: cpu.and_then(|c| c.cores).unwrap_or(1),
                threads: cpu.and_then(|c| c.threads).unwrap_or(1),
            },
        },
        os: DomainOs {
            os_type: OsType { value: "hvm" },
            boot: Boot { dev: "hd" },
        },
        devices: DomainDevices { disk: disks },
    };
    quick_xml::se::to_string(&domain).map_err(|e| Error::serialization("LibvirtDomain", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_common::kubevirt::{
        ClaimVolumeSource, Cpu, Memory, VirtualMachineSpec, Volume,
    };
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;
    use rstest::rstest;

    fn claim(name: &str, mode: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_mode: Some(mode.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn vm() -> VirtualMachine {
        let mut vm = VirtualMachine::new("web", VirtualMachineSpec::default());
        let domain = &mut vm.spec.template.spec.domain;
        domain.cpu = Some(Cpu {
            sockets: Some(2),
            cores: Some(4),
            ..Default::default()
        });
        domain.memory = Some(Memory {
            guest: Some(Quantity("2Gi".to_string())),
        });
        for (i, name) in ["pvc-a", "pvc-b"].iter().enumerate() {
            vm.spec.template.spec.volumes.push(Volume {
                name: format!("vol-{}", i),
                persistent_volume_claim: Some(ClaimVolumeSource {
                    claim_name: name.to_string(),
                }),
                ..Default::default()
            });
        }
        vm
    }

    #[test]
    fn test_disks_point_at_pod_paths_by_volume_order() {
        let xml = libvirt_domain(&vm(), &[claim("pvc-b", "Block"), claim("pvc-a", "Filesystem")])
            .unwrap();
        assert!(xml.starts_with("<domain type=\"kvm\">"), "{xml}");
        assert!(xml.contains("<name>web</name>"));
        assert!(xml.contains("<memory unit=\"KiB\">2097152</memory>"));
        assert!(xml.contains("<topology sockets=\"2\" cores=\"4\" threads=\"1\"/>"));
        assert!(xml.contains("<source file=\"/mnt/disks/disk0/disk.img\"/>"));
        assert!(xml.contains("<source dev=\"/dev/block1\"/>"));
        assert!(xml.contains("<target dev=\"hda\" bus=\"virtio\"/>"));
        assert!(xml.contains("<target dev=\"hdb\" bus=\"virtio\"/>"));
        assert!(xml.contains("<boot dev=\"hd\"/>"));
    }

    #[test]
    fn test_missing_claim_is_not_found() {
        let err = libvirt_domain(&vm(), &[claim("pvc-a", "Filesystem")]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[rstest]
    #[case(0, "hda")]
    #[case(25, "hdz")]
    #[case(26, "hdaa")]
    #[case(27, "hdab")]
    fn test_disk_targets(#[case] i: usize, #[case] expected: &str) {
        assert_eq!(disk_target(i), expected);
    }

    #[rstest]
    #[case("4096Mi", Some(4096 << 20))]
    #[case("2G", Some(2_000_000_000))]
    #[case("1024", Some(1024))]
    #[case("lots", None)]
    fn test_quantities(#[case] raw: &str, #[case] expected: Option<u64>) {
        assert_eq!(quantity_bytes(raw), expected);
    }
}
