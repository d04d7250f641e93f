//! The per-plan convergence engine
//!
//! One engine serves every VM of a migration attempt. It holds no per-VM
//! state: every lookup is scoped by the VM's ownership labels, so passes for
//! different VMs may run concurrently on the same engine.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::warn;

use ferry_builder::{builder_for, BuildContext, Builder};
use ferry_common::plan::{Inventory, MigrationPlan, MigrationRef, SourceVm, VmStatus};
use ferry_common::store::{object_ref, Kind};
use ferry_common::{Error, OwnershipLabels, ResourceStore, Result, Settings, TypedStore};

use crate::conversion::{ConversionControl, HttpConversionControl};

/// Idempotent create-or-adopt of every target object a VM import needs
pub struct ConvergenceEngine {
    pub(crate) store: TypedStore,
    pub(crate) inventory: Arc<dyn Inventory>,
    pub(crate) builder: Box<dyn Builder>,
    pub(crate) labels: OwnershipLabels,
    pub(crate) plan: MigrationPlan,
    pub(crate) settings: Settings,
    pub(crate) source_secret_name: Option<String>,
    pub(crate) control: Arc<dyn ConversionControl>,
}

impl ConvergenceEngine {
    /// Engine for one migration attempt of `ctx.plan`, talking HTTP to
    /// conversion pods
    pub fn new(
        store: Arc<dyn ResourceStore>,
        inventory: Arc<dyn Inventory>,
        ctx: BuildContext,
        migration: &MigrationRef,
    ) -> Result<Self> {
        let control = Arc::new(HttpConversionControl::new(&ctx.settings)?);
        Ok(Self::with_control(store, inventory, ctx, migration, control))
    }

    /// Engine with an explicit conversion control client
    pub fn with_control(
        store: Arc<dyn ResourceStore>,
        inventory: Arc<dyn Inventory>,
        ctx: BuildContext,
        migration: &MigrationRef,
        control: Arc<dyn ConversionControl>,
    ) -> Self {
        let labels = OwnershipLabels::new(&migration.uid, &ctx.plan.uid);
        let plan = ctx.plan.clone();
        let settings = ctx.settings.clone();
        let source_secret_name = ctx.source_secret.metadata.name.clone();
        Self {
            store: TypedStore::new(store),
            inventory,
            builder: builder_for(ctx),
            labels,
            plan,
            settings,
            source_secret_name,
            control,
        }
    }

    /// Ownership label scheme of this migration attempt
    pub fn labels(&self) -> &OwnershipLabels {
        &self.labels
    }

    /// The plan being executed
    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    /// The provider builder selected for the plan
    pub fn builder(&self) -> &dyn Builder {
        self.builder.as_ref()
    }

    pub(crate) fn namespace(&self) -> &str {
        &self.plan.target_namespace
    }

    /// `<plan>-<vmID>-`
    pub(crate) fn generated_name(&self, vm: &VmStatus) -> String {
        format!("{}-{}-", self.plan.name, vm.id)
    }

    /// Confirm the VM still resolves in the source inventory
    pub(crate) async fn source_vm(&self, vm: &VmStatus) -> Result<SourceVm> {
        self.inventory.vm(&vm.id).await
    }

    /// Create an object named by `metadata.generateName`.
    ///
    /// A suffix collision is retried with a fresh suffix up to
    /// `create_retries` times. Nothing is ever deleted to make room.
    pub(crate) async fn create_generated<K: Kind>(&self, obj: &K, vm: &VmStatus) -> Result<K> {
        let attempts = self.settings.create_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.store.create(obj).await {
                Ok(created) => return Ok(created),
                Err(e) if e.is_already_exists() && attempt < attempts => {
                    warn!(
                        vm = %vm.id,
                        kind = %K::kind(&()),
                        attempt,
                        "generated name collided, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(self.wrap::<K>(e, obj, vm)),
            }
        }
    }

    /// Attach object and VM context to a store error
    pub(crate) fn wrap<K: Kind>(&self, err: Error, obj: &K, vm: &VmStatus) -> Error {
        let name = obj
            .meta()
            .name
            .clone()
            .or_else(|| obj.meta().generate_name.clone())
            .unwrap_or_default();
        err.wrap(
            &K::kind(&()),
            &object_ref(obj.namespace().as_deref(), &name),
            &vm.id,
        )
    }

    /// Attach VM context to an error about `kind` objects in the target
    /// namespace
    pub(crate) fn wrap_kind<K: Kind>(&self, err: Error, name: &str, vm: &VmStatus) -> Error {
        err.wrap(
            &K::kind(&()),
            &object_ref(Some(self.namespace()), name),
            &vm.id,
        )
    }
}
