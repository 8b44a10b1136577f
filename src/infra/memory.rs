//! In-memory virtualization platform
//!
//! Backs the engine without a cluster: the `simulate` command and the tests
//! run against it. Faults can be queued per operation and power state can be
//! changed behind the engine's back to mimic an administrator.

use super::{
    Fault, HasReference, Infrastructure, Placement, PowerState, Registry, VmConfig, VmProperties,
    VmRef, VmRuntime, VmSpec,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Platform operations, used for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Reconfigure,
    PowerOn,
    PowerOff,
    Signal,
    Delete,
    Unregister,
    DeleteFiles,
    Properties,
    PoolVms,
}

#[derive(Debug, Clone)]
struct MemoryVm {
    reference: VmRef,
    pool: String,
    config: VmConfig,
    power_state: PowerState,
    version: u64,
    ignores_signals: bool,
}

impl HasReference for MemoryVm {
    fn reference(&self) -> &str {
        self.reference.as_str()
    }
}

impl MemoryVm {
    fn properties(&self) -> VmProperties {
        VmProperties {
            config: self.config.clone(),
            runtime: VmRuntime {
                power_state: self.power_state,
            },
        }
    }

    fn bump_version(&mut self) {
        self.version += 1;
        self.config.change_version = self.version.to_string();
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    vms: Registry<MemoryVm>,
    faults: HashMap<Operation, VecDeque<Fault>>,
    calls: HashMap<Operation, usize>,
    next_id: u64,
}

impl MemoryState {
    /// Count the call and pop an injected fault for it, if any
    fn enter(&mut self, op: Operation) -> Result<(), Fault> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn vm_mut(&mut self, vm: &VmRef) -> Result<&mut MemoryVm, Fault> {
        self.vms
            .get_mut(vm.as_str())
            .ok_or_else(|| Fault::NotFound(vm.to_string()))
    }
}

/// In-memory [`Infrastructure`] implementation
#[derive(Debug, Default)]
pub struct MemoryInfrastructure {
    state: Mutex<MemoryState>,
}

impl MemoryInfrastructure {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a fault returned by the next call of `op`
    pub fn inject_fault(&self, op: Operation, fault: Fault) {
        self.lock().faults.entry(op).or_default().push_back(fault);
    }

    /// Number of times `op` has been called
    pub fn call_count(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of VMs in the inventory
    pub fn vm_count(&self) -> usize {
        self.lock().vms.len()
    }

    /// Current properties of a VM, bypassing counters and faults
    pub fn inspect(&self, vm: &VmRef) -> Option<VmProperties> {
        self.lock().vms.get(vm.as_str()).map(MemoryVm::properties)
    }

    /// Change a VM's power state out of band
    pub fn set_power_state(&self, vm: &VmRef, power_state: PowerState) -> bool {
        let mut state = self.lock();
        match state.vms.get_mut(vm.as_str()) {
            Some(entry) => {
                entry.power_state = power_state;
                true
            }
            None => false,
        }
    }

    /// Delete a VM out of band
    pub fn remove_out_of_band(&self, vm: &VmRef) -> bool {
        self.lock().vms.remove(vm.as_str()).is_some()
    }

    /// Make the guest ignore stop signals so only a hard power off works
    pub fn ignore_signals(&self, vm: &VmRef, ignore: bool) {
        if let Some(entry) = self.lock().vms.get_mut(vm.as_str()) {
            entry.ignores_signals = ignore;
        }
    }

    /// Register an existing VM, as found when the engine starts against a live pool
    pub fn insert_vm(&self, pool: &str, config: VmConfig, power_state: PowerState) -> VmRef {
        let mut state = self.lock();
        state.next_id += 1;
        let reference = VmRef::new(format!("vm-{}", state.next_id));
        let mut vm = MemoryVm {
            reference: reference.clone(),
            pool: pool.to_string(),
            config,
            power_state,
            version: 0,
            ignores_signals: false,
        };
        vm.bump_version();
        state.vms.insert(vm);
        reference
    }
}

#[async_trait]
impl Infrastructure for MemoryInfrastructure {
    async fn create_vm(&self, placement: &Placement, spec: &VmSpec) -> Result<VmRef, Fault> {
        let mut state = self.lock();
        state.enter(Operation::Create)?;

        state.next_id += 1;
        let reference = VmRef::new(format!("vm-{}", state.next_id));
        let mut vm = MemoryVm {
            reference: reference.clone(),
            pool: placement.pool().to_string(),
            config: VmConfig {
                name: spec.name.clone().unwrap_or_else(|| reference.to_string()),
                change_version: String::new(),
                instance_uuid: spec.instance_uuid.clone().unwrap_or_default(),
                num_cpus: spec.num_cpus.unwrap_or(1),
                memory_mb: spec.memory_mb.unwrap_or(2048),
                extra_config: spec.extra_config.clone().unwrap_or_default(),
            },
            power_state: PowerState::PoweredOff,
            version: 0,
            ignores_signals: false,
        };
        vm.bump_version();
        state.vms.insert(vm);
        Ok(reference)
    }

    async fn reconfigure_vm(&self, vm: &VmRef, spec: &VmSpec) -> Result<(), Fault> {
        let mut state = self.lock();
        state.enter(Operation::Reconfigure)?;
        let entry = state.vm_mut(vm)?;

        if let Some(version) = &spec.change_version {
            if *version != entry.config.change_version {
                return Err(Fault::ConcurrentAccess(vm.to_string()));
            }
        }

        if let Some(name) = &spec.name {
            entry.config.name = name.clone();
        }
        if let Some(cpus) = spec.num_cpus {
            entry.config.num_cpus = cpus;
        }
        if let Some(memory) = spec.memory_mb {
            entry.config.memory_mb = memory;
        }
        if let Some(extra) = &spec.extra_config {
            entry.config.extra_config.extend(extra.clone());
        }
        entry.bump_version();
        Ok(())
    }

    async fn power_on(&self, vm: &VmRef) -> Result<(), Fault> {
        let mut state = self.lock();
        state.enter(Operation::PowerOn)?;
        let entry = state.vm_mut(vm)?;
        if entry.power_state == PowerState::PoweredOn {
            return Err(Fault::InvalidState(format!("{} is already powered on", vm)));
        }
        entry.power_state = PowerState::PoweredOn;
        Ok(())
    }

    async fn power_off(&self, vm: &VmRef) -> Result<(), Fault> {
        let mut state = self.lock();
        state.enter(Operation::PowerOff)?;
        let entry = state.vm_mut(vm)?;
        if entry.power_state == PowerState::PoweredOff {
            return Err(Fault::InvalidState(format!("{} is already powered off", vm)));
        }
        entry.power_state = PowerState::PoweredOff;
        Ok(())
    }

    async fn signal(&self, vm: &VmRef, _signal: i64) -> Result<(), Fault> {
        let mut state = self.lock();
        state.enter(Operation::Signal)?;
        let entry = state.vm_mut(vm)?;
        if entry.power_state != PowerState::PoweredOn {
            return Err(Fault::InvalidState(format!("{} is not running", vm)));
        }
        // The container process is the guest's init; it exiting powers the VM off.
        if !entry.ignores_signals {
            entry.power_state = PowerState::PoweredOff;
        }
        Ok(())
    }

    async fn delete_vm(&self, vm: &VmRef) -> Result<(), Fault> {
        let mut state = self.lock();
        state.enter(Operation::Delete)?;
        let entry = state.vm_mut(vm)?;
        if entry.power_state == PowerState::PoweredOn {
            return Err(Fault::InvalidState(format!("{} is powered on", vm)));
        }
        state.vms.remove(vm.as_str());
        Ok(())
    }

    async fn unregister_vm(&self, vm: &VmRef) -> Result<(), Fault> {
        let mut state = self.lock();
        state.enter(Operation::Unregister)?;
        state
            .vms
            .remove(vm.as_str())
            .map(|_| ())
            .ok_or_else(|| Fault::NotFound(vm.to_string()))
    }

    async fn delete_files(&self, _datacenter: &str, vm: &VmRef) -> Result<(), Fault> {
        let mut state = self.lock();
        state.enter(Operation::DeleteFiles)?;
        if state.vms.contains(vm.as_str()) {
            return Err(Fault::InvalidState(format!("{} is still registered", vm)));
        }
        Ok(())
    }

    async fn properties(&self, vm: &VmRef) -> Result<VmProperties, Fault> {
        let mut state = self.lock();
        state.enter(Operation::Properties)?;
        state.vm_mut(vm).map(|entry| entry.properties())
    }

    async fn pool_vms(&self, pool: &str) -> Result<Vec<VmRef>, Fault> {
        let mut state = self.lock();
        state.enter(Operation::PoolVms)?;
        let mut vms: Vec<VmRef> = state
            .vms
            .values()
            .filter(|vm| vm.pool == pool)
            .map(|vm| vm.reference.clone())
            .collect();
        vms.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(vms)
    }
}
