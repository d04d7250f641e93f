//! The target VM and the imported VMs of a plan

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde_json::json;
use tracing::{debug, info, instrument};

use ferry_common::kubevirt::{Condition, DataVolume, VirtualMachine};
use ferry_common::labels::{matches, Labels, LABEL_VM};
use ferry_common::plan::VmStatus;
use ferry_common::{Error, Result};

use crate::engine::ConvergenceEngine;

/// A DataVolume with the claim backing it
#[derive(Clone, Debug)]
pub struct ExtendedDataVolume {
    /// The DataVolume
    pub data_volume: DataVolume,
    /// Backing claim, once CDI created it
    pub claim: Option<PersistentVolumeClaim>,
}

impl ExtendedDataVolume {
    /// Transfer progress as a fraction in `[0, 1]`. Unknown progress
    /// (`"N/A"`, missing) is 0.
    pub fn percent_complete(&self) -> f64 {
        self.data_volume
            .status
            .as_ref()
            .and_then(|s| s.progress.as_deref())
            .and_then(|p| p.trim().trim_end_matches('%').parse::<f64>().ok())
            .map(|p| (p / 100.0).clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    /// CDI phase
    pub fn phase(&self) -> Option<&str> {
        self.data_volume
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
    }

    /// CDI conditions
    pub fn conditions(&self) -> &[Condition] {
        self.data_volume
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

/// A target VM of the plan with its import volumes
#[derive(Clone, Debug)]
pub struct ImportedVm {
    /// The VM resource
    pub vm: VirtualMachine,
    /// DataVolumes mounted by the VM
    pub data_volumes: Vec<ExtendedDataVolume>,
}

impl ImportedVm {
    /// Source VM id, from the ownership labels
    pub fn id(&self) -> Option<&str> {
        self.vm
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_VM))
            .map(String::as_str)
    }

    /// Mean transfer progress over every DataVolume
    pub fn percent_complete(&self) -> f64 {
        if self.data_volumes.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .data_volumes
            .iter()
            .map(ExtendedDataVolume::percent_complete)
            .sum();
        total / self.data_volumes.len() as f64
    }
}

impl ConvergenceEngine {
    /// Create the target VM once, then make it the owner of every claim of
    /// the VM.
    ///
    /// The lookup leaves out the migration label, so a retried migration of
    /// the same plan adopts the VM instead of creating a second one. An
    /// existing VM is never overwritten, and a VM of the same name owned by
    /// another source VM or plan is never adopted.
    #[instrument(skip_all, fields(vm = %vm.id))]
    pub async fn ensure_vm(&self, vm: &mut VmStatus) -> Result<VirtualMachine> {
        let owner = self.labels.vm_all_but_migration(&vm.id);
        let existing: Vec<VirtualMachine> = self
            .store
            .list(Some(self.namespace()), &owner)
            .await
            .map_err(|e| self.wrap_kind::<VirtualMachine>(e, &vm.name, vm))?;

        let target = match existing.into_iter().next() {
            Some(found) => {
                if let Some(name) = found.metadata.name.as_ref() {
                    vm.name.clone_from(name);
                }
                debug!(name = %vm.name, "virtual machine already exists");
                found
            }
            None => {
                let claims = self.get_pvcs(vm).await?;
                let desired = self.virtual_machine(vm, &claims).await?;
                match self.store.create(&desired).await {
                    Ok(created) => {
                        info!(name = %vm.name, "created virtual machine");
                        created
                    }
                    Err(e) if e.is_already_exists() => {
                        let found: VirtualMachine = self
                            .store
                            .get(Some(self.namespace()), &vm.name)
                            .await
                            .map_err(|e| self.wrap(e, &desired, vm))?;
                        if !matches(found.metadata.labels.as_ref(), &owner) {
                            return Err(Error::validation_for(
                                &vm.id,
                                format!(
                                    "virtual machine {}/{} belongs to another VM or plan",
                                    self.namespace(),
                                    vm.name
                                ),
                            ));
                        }
                        debug!(name = %vm.name, "virtual machine created concurrently, adopting");
                        found
                    }
                    Err(e) => return Err(self.wrap(e, &desired, vm)),
                }
            }
        };

        self.set_claim_ownership(vm, &target).await?;
        Ok(target)
    }

    /// Add the VM as owner of the VM's claims in the target namespace
    async fn set_claim_ownership(&self, vm: &VmStatus, target: &VirtualMachine) -> Result<()> {
        let owner = target.owner_reference();
        for claim in self.get_pvcs(vm).await? {
            if claim.metadata.namespace.as_deref() != Some(self.namespace()) {
                continue;
            }
            let mut owners = claim.metadata.owner_references.clone().unwrap_or_default();
            if owners.iter().any(|o| o.uid == owner.uid) {
                continue;
            }
            owners.push(owner.clone());
            let name = claim.metadata.name.clone().unwrap_or_default();
            self.store
                .patch_merge::<PersistentVolumeClaim>(
                    Some(self.namespace()),
                    &name,
                    json!({ "metadata": { "ownerReferences": owners } }),
                )
                .await
                .map_err(|e| self.wrap(e, &claim, vm))?;
            debug!(claim = %name, "claim owned by virtual machine");
        }
        Ok(())
    }

    /// Target VMs of the plan, from any migration attempt, with their
    /// DataVolumes and claims. DataVolumes are matched by the claims the VM
    /// mounts, not by labels.
    pub async fn list_vms(&self) -> Result<Vec<ImportedVm>> {
        let vms: Vec<VirtualMachine> = self
            .store
            .list(Some(self.namespace()), &self.labels.plan_only())
            .await?;
        let data_volumes: Vec<DataVolume> = self
            .store
            .list(Some(self.namespace()), &Labels::new())
            .await?;

        let mut imported = Vec::with_capacity(vms.len());
        for vm in vms {
            let mut extended = Vec::new();
            for dv in data_volumes.iter().filter(|dv| vm.owns(dv)) {
                let claim = match dv.metadata.name.as_deref() {
                    Some(name) => self.store.find(Some(self.namespace()), name).await?,
                    None => None,
                };
                extended.push(ExtendedDataVolume {
                    data_volume: dv.clone(),
                    claim,
                });
            }
            imported.push(ImportedVm {
                vm,
                data_volumes: extended,
            });
        }
        Ok(imported)
    }

    /// [`Self::list_vms`] keyed by source VM id. VMs without the id label
    /// are left out.
    pub async fn virtual_machine_map(&self) -> Result<BTreeMap<String, ImportedVm>> {
        Ok(self
            .list_vms()
            .await?
            .into_iter()
            .filter_map(|vm| vm.id().map(str::to_string).map(|id| (id, vm)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::*;
    use ferry_common::kubevirt::{
        ClaimVolumeSource, DataVolumeSpec, DataVolumeStatus, VirtualMachineSpec, Volume,
    };
    use ferry_common::labels::{LABEL_MIGRATION, LABEL_PLAN};
    use ferry_common::memory::Op;
    use ferry_common::plan::ProviderType;
    use ferry_common::store::{api_resource, to_dynamic};
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;
    use rstest::rstest;

    #[tokio::test]
    async fn test_vm_is_created_once_and_owns_its_claims() {
        let source = source_vm("vm-1", ProviderType::OVirt);
        let h = harness(ProviderType::OVirt, vec![source.clone()]);
        let mut vm = status(&source);
        import_claims(&h, &vm).await;

        let first = h.engine.ensure_vm(&mut vm).await.unwrap();
        let second = h.engine.ensure_vm(&mut vm).await.unwrap();

        assert_eq!(first.metadata.uid, second.metadata.uid);
        assert_eq!(h.store.count(Op::Create, "VirtualMachine"), 1);
        assert_eq!(vm.name, "vm-1-vm");
        let uid = first.metadata.uid.unwrap();
        for claim in h.store.objects("PersistentVolumeClaim") {
            let owners = claim.metadata.owner_references.unwrap();
            assert_eq!(owners.len(), 1, "owner added once");
            assert_eq!(owners[0].uid, uid);
            assert_eq!(owners[0].block_owner_deletion, Some(true));
        }
    }

    #[tokio::test]
    async fn test_retried_migration_adopts_the_existing_vm() {
        let source = source_vm("vm-1", ProviderType::OVirt);
        let h = harness(ProviderType::OVirt, vec![source.clone()]);
        let mut vm = status(&source);
        let mut labels = h.engine.labels().vm_labels("vm-1");
        labels.insert(LABEL_MIGRATION.to_string(), "mig-0".to_string());
        let mut previous = VirtualMachine::new("kept-name", VirtualMachineSpec::default());
        previous.metadata.namespace = Some(NS.to_string());
        previous.metadata.labels = Some(labels);
        h.store
            .seed(&api_resource::<VirtualMachine>(), to_dynamic(&previous).unwrap());

        let adopted = h.engine.ensure_vm(&mut vm).await.unwrap();

        assert_eq!(adopted.metadata.name.as_deref(), Some("kept-name"));
        assert_eq!(vm.name, "kept-name");
        assert_eq!(h.store.count(Op::Create, "VirtualMachine"), 0);
    }

    #[tokio::test]
    async fn test_teardown_after_retry_removes_the_adopted_vm() {
        let source = source_vm("vm-1", ProviderType::OVirt);
        let h = harness(ProviderType::OVirt, vec![source.clone()]);
        let mut vm = status(&source);
        let mut labels = h.engine.labels().vm_labels("vm-1");
        labels.insert(LABEL_MIGRATION.to_string(), "mig-0".to_string());
        let mut previous = VirtualMachine::new("kept-name", VirtualMachineSpec::default());
        previous.metadata.namespace = Some(NS.to_string());
        previous.metadata.labels = Some(labels.clone());
        h.store
            .seed(&api_resource::<VirtualMachine>(), to_dynamic(&previous).unwrap());
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("kept-secret".to_string()),
                namespace: Some(NS.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        h.store
            .seed(&api_resource::<Secret>(), to_dynamic(&secret).unwrap());

        h.engine.ensure_vm(&mut vm).await.unwrap();
        let report = h.engine.delete_vm_resources(&vm).await;

        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(h.store.objects("VirtualMachine").is_empty());
        assert!(h.store.objects("Secret").is_empty());
    }

    #[tokio::test]
    async fn test_rewritten_names_that_collide_are_not_adopted() {
        let mut a = source_vm("vm-a", ProviderType::OVirt);
        a.name = "my-vm".to_string();
        let mut b = source_vm("vm-b", ProviderType::OVirt);
        b.name = "My VM".to_string();
        let h = harness(ProviderType::OVirt, vec![a.clone(), b.clone()]);
        let mut vm_a = status(&a);
        let mut vm_b = status(&b);
        import_claims(&h, &vm_a).await;
        let claims_b = import_claims(&h, &vm_b).await;

        let target_a = h.engine.ensure_vm(&mut vm_a).await.unwrap();
        let err = h.engine.ensure_vm(&mut vm_b).await.unwrap_err();

        assert!(matches!(err, Error::Validation { .. }), "{err}");
        assert_eq!(err.vm(), Some("vm-b"));
        let vms = h.store.objects("VirtualMachine");
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].metadata.uid, target_a.metadata.uid);
        let b_names: Vec<_> = claims_b.iter().filter_map(|c| c.metadata.name.clone()).collect();
        for claim in h.store.objects("PersistentVolumeClaim") {
            if b_names.contains(claim.metadata.name.as_ref().unwrap()) {
                assert!(claim.metadata.owner_references.unwrap_or_default().is_empty());
            }
        }

        h.engine.delete_vm_resources(&vm_a).await;
        let left = h
            .store
            .objects("PersistentVolumeClaim")
            .into_iter()
            .filter(|c| b_names.contains(c.metadata.name.as_ref().unwrap()))
            .count();
        assert_eq!(left, b_names.len());
    }

    #[tokio::test]
    async fn test_missing_claims_fail_with_vm_context() {
        let source = source_vm("vm-1", ProviderType::OVirt);
        let h = harness(ProviderType::OVirt, vec![source.clone()]);
        let mut vm = status(&source);

        let err = h.engine.ensure_vm(&mut vm).await.unwrap_err();
        assert_eq!(err.vm(), Some("vm-1"));
        assert_eq!(h.store.count(Op::Create, "VirtualMachine"), 0);
    }

    fn data_volume(name: &str, progress: Option<&str>) -> DataVolume {
        let mut dv = DataVolume::new(name, DataVolumeSpec::default());
        dv.metadata.namespace = Some(NS.to_string());
        dv.metadata.labels = Some(BTreeMap::from([(LABEL_PLAN.to_string(), PLAN.to_string())]));
        dv.status = Some(DataVolumeStatus {
            phase: Some("ImportInProgress".to_string()),
            progress: progress.map(str::to_string),
            ..Default::default()
        });
        dv
    }

    fn imported(id: &str, claims: &[&str]) -> VirtualMachine {
        let mut vm = VirtualMachine::new(&format!("{}-vm", id), VirtualMachineSpec::default());
        vm.metadata.namespace = Some(NS.to_string());
        vm.metadata.labels = Some(BTreeMap::from([
            (LABEL_PLAN.to_string(), PLAN.to_string()),
            (LABEL_VM.to_string(), id.to_string()),
        ]));
        vm.spec.template.spec.volumes = claims
            .iter()
            .enumerate()
            .map(|(i, claim)| Volume {
                name: format!("vol-{}", i),
                persistent_volume_claim: Some(ClaimVolumeSource {
                    claim_name: claim.to_string(),
                }),
                ..Default::default()
            })
            .collect();
        vm
    }

    #[tokio::test]
    async fn test_imported_vms_carry_their_volumes_and_claims() {
        let h = harness(ProviderType::OVirt, vec![]);
        for vm in [imported("vm-1", &["dv-a", "dv-b"]), imported("vm-2", &["dv-c"])] {
            h.store
                .seed(&api_resource::<VirtualMachine>(), to_dynamic(&vm).unwrap());
        }
        for (name, progress) in [("dv-a", "50%"), ("dv-b", "100.0%"), ("dv-c", "10%")] {
            h.store.seed(
                &api_resource::<DataVolume>(),
                to_dynamic(&data_volume(name, Some(progress))).unwrap(),
            );
        }
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("dv-a".to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        h.store
            .seed(&api_resource::<PersistentVolumeClaim>(), to_dynamic(&claim).unwrap());

        let map = h.engine.virtual_machine_map().await.unwrap();

        assert_eq!(map.len(), 2);
        let first = &map["vm-1"];
        assert_eq!(first.data_volumes.len(), 2);
        assert!((first.percent_complete() - 0.75).abs() < f64::EPSILON);
        let with_claim: Vec<_> = first
            .data_volumes
            .iter()
            .filter(|dv| dv.claim.is_some())
            .collect();
        assert_eq!(with_claim.len(), 1);
        assert_eq!(with_claim[0].phase(), Some("ImportInProgress"));
        assert_eq!(map["vm-2"].data_volumes.len(), 1);
    }

    #[rstest]
    #[case(Some("45.5%"), 0.455)]
    #[case(Some("100.0%"), 1.0)]
    #[case(Some("N/A"), 0.0)]
    #[case(None, 0.0)]
    fn test_progress_is_a_fraction(#[case] progress: Option<&str>, #[case] expected: f64) {
        let dv = ExtendedDataVolume {
            data_volume: data_volume("dv", progress),
            claim: None,
        };
        assert!((dv.percent_complete() - expected).abs() < 1e-9);
        assert!(dv.conditions().is_empty());
    }
}
