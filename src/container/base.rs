//! VM-backed container snapshots

use super::config::ExecConfig;
use crate::error::{Result, Step, VesselError};
use crate::infra::{
    Fault, Infrastructure, PowerState, TaskContext, VmConfig, VmProperties, VmRef, VmRuntime,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Signal asking the container process to exit
const SIGTERM: i64 = 15;

/// A container's configuration and runtime as last read from its VM
///
/// Cached snapshots are never modified in place; a refresh produces a new
/// value that replaces the old one. Handles clone the snapshot and get a
/// private exec config on first write.
#[derive(Debug, Clone)]
pub struct ContainerBase {
    exec_config: Arc<ExecConfig>,
    config: Option<Arc<VmConfig>>,
    runtime: Option<VmRuntime>,
    vm: Option<VmRef>,
}

impl ContainerBase {
    /// Snapshot for a container whose VM does not exist yet
    pub(crate) fn new(exec_config: ExecConfig) -> Self {
        Self {
            exec_config: Arc::new(exec_config),
            config: None,
            runtime: None,
            vm: None,
        }
    }

    /// Rebuild a snapshot from a VM found on the platform
    pub(crate) fn from_vm(vm: VmRef, properties: VmProperties) -> Result<Self> {
        let exec_config = ExecConfig::decode(&properties.config.extra_config)?
            .filter(|config| !config.id.is_empty())
            .ok_or_else(|| {
                VesselError::InvalidRequest(format!("VM {} carries no container ID", vm))
            })?;

        Ok(Self {
            exec_config: Arc::new(exec_config),
            config: Some(Arc::new(properties.config)),
            runtime: Some(properties.runtime),
            vm: Some(vm),
        })
    }

    pub fn id(&self) -> &str {
        &self.exec_config.id
    }

    pub fn exec_config(&self) -> &ExecConfig {
        &self.exec_config
    }

    pub(crate) fn exec_config_mut(&mut self) -> &mut ExecConfig {
        Arc::make_mut(&mut self.exec_config)
    }

    pub fn vm_config(&self) -> Option<&VmConfig> {
        self.config.as_deref()
    }

    pub fn runtime(&self) -> Option<VmRuntime> {
        self.runtime
    }

    pub fn power_state(&self) -> Option<PowerState> {
        self.runtime.map(|r| r.power_state)
    }

    pub fn change_version(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.change_version.as_str())
    }

    pub fn vm(&self) -> Option<&VmRef> {
        self.vm.as_ref()
    }

    pub(crate) fn set_vm(&mut self, vm: VmRef) {
        self.vm = Some(vm);
    }

    pub(crate) fn set_power_state(&mut self, power_state: PowerState) {
        self.runtime = Some(VmRuntime { power_state });
    }

    fn vm_ref(&self) -> Result<&VmRef> {
        self.vm
            .as_ref()
            .ok_or_else(|| VesselError::MissingVm(self.id().to_string()))
    }

    /// Take config and runtime from fresh properties, keeping the exec config
    pub(crate) fn apply_properties(&mut self, properties: VmProperties) {
        self.config = Some(Arc::new(properties.config));
        self.runtime = Some(properties.runtime);
    }

    /// Read the VM's current properties
    pub(crate) async fn properties(
        &self,
        infra: &dyn Infrastructure,
        ctx: &TaskContext,
    ) -> std::result::Result<VmProperties, Fault> {
        let vm = self
            .vm
            .as_ref()
            .ok_or_else(|| Fault::NotFound(self.id().to_string()))?;
        ctx.wait(infra.properties(vm)).await
    }

    /// Read the VM's current properties into a new snapshot
    ///
    /// The exec config is taken from the VM when it carries one for this
    /// container, otherwise the current one is kept.
    pub(crate) async fn refresh(
        &self,
        infra: &dyn Infrastructure,
        ctx: &TaskContext,
    ) -> std::result::Result<ContainerBase, Fault> {
        let properties = self.properties(infra, ctx).await?;

        let mut base = self.clone();
        match ExecConfig::decode(&properties.config.extra_config) {
            Ok(Some(exec_config)) if exec_config.id == self.id() => {
                base.exec_config = Arc::new(exec_config);
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring unreadable exec config of {}: {}", self.id(), e),
        }
        base.apply_properties(properties);
        Ok(base)
    }

    /// Power on the VM
    pub(crate) async fn start(&self, infra: &dyn Infrastructure, ctx: &TaskContext) -> Result<()> {
        let vm = self.vm_ref()?;
        ctx.wait(infra.power_on(vm)).await.map_err(|f| {
            error!("Failed to power on {}: {}", self.id(), f);
            VesselError::infra(self.id(), Step::Start, f)
        })
    }

    /// Stop gracefully, powering off once `wait` has passed
    pub(crate) async fn stop(
        &self,
        infra: &dyn Infrastructure,
        ctx: &TaskContext,
        wait: Duration,
        poll: Duration,
    ) -> Result<()> {
        let vm = self.vm_ref()?;

        match self.shutdown(infra, ctx, vm, wait, poll).await {
            Ok(true) => return Ok(()),
            Ok(false) => warn!("{} did not stop within {:?}, powering off", self.id(), wait),
            Err(f) => warn!("Graceful stop of {} failed: {}", self.id(), f),
        }

        match ctx.wait(infra.power_off(vm)).await {
            Ok(()) => Ok(()),
            Err(Fault::InvalidState(msg)) => {
                debug!("Power off of {} not needed: {}", self.id(), msg);
                Ok(())
            }
            Err(f) => {
                error!("Failed to power off {}: {}", self.id(), f);
                Err(VesselError::infra(self.id(), Step::Stop, f))
            }
        }
    }

    /// Signal the container process and wait for the VM to power off
    async fn shutdown(
        &self,
        infra: &dyn Infrastructure,
        ctx: &TaskContext,
        vm: &VmRef,
        wait: Duration,
        poll: Duration,
    ) -> std::result::Result<bool, Fault> {
        match ctx.wait(infra.signal(vm, SIGTERM)).await {
            Ok(()) | Err(Fault::InvalidState(_)) => {}
            Err(f) => return Err(f),
        }

        let deadline = Instant::now() + wait;
        loop {
            let properties = ctx.wait(infra.properties(vm)).await?;
            if properties.runtime.power_state == PowerState::PoweredOff {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            ctx.sleep(poll.min(deadline - now)).await?;
        }
    }
}

/// Instance UUID for a container's VM, stable for a given host and container ID
pub fn instance_uuid(id: &str) -> String {
    let host = gethostname::gethostname();
    let namespace = Uuid::new_v5(&Uuid::NAMESPACE_DNS, host.to_string_lossy().as_bytes());
    Uuid::new_v5(&namespace, id.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{MemoryInfrastructure, Operation, Placement, VmSpec};

    fn ctx() -> TaskContext {
        TaskContext::new(Duration::from_secs(5))
    }

    async fn running_base(infra: &MemoryInfrastructure) -> ContainerBase {
        let exec_config = ExecConfig::new("abc", "web", "nginx");
        let spec = VmSpec {
            extra_config: Some(exec_config.encode().unwrap()),
            ..VmSpec::default()
        };
        let placement = Placement::Folder {
            folder: "vm".to_string(),
            pool: "pool".to_string(),
        };
        let vm = infra.create_vm(&placement, &spec).await.unwrap();
        infra.power_on(&vm).await.unwrap();

        let mut base = ContainerBase::new(exec_config);
        base.set_vm(vm);
        base
    }

    #[test]
    fn test_instance_uuid_is_stable() {
        assert_eq!(instance_uuid("abc"), instance_uuid("abc"));
        assert_ne!(instance_uuid("abc"), instance_uuid("abd"));
        assert!(Uuid::parse_str(&instance_uuid("abc")).is_ok());
    }

    #[test]
    fn test_from_vm_requires_container_id() {
        let properties = VmProperties {
            config: VmConfig::default(),
            runtime: VmRuntime {
                power_state: PowerState::PoweredOff,
            },
        };
        assert!(ContainerBase::from_vm(VmRef::new("vm-1"), properties).is_err());
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let infra = MemoryInfrastructure::new();
        let base = running_base(&infra).await;

        base.stop(&infra, &ctx(), Duration::from_secs(1), Duration::from_millis(5))
            .await
            .unwrap();

        assert_eq!(infra.call_count(Operation::PowerOff), 0);
        let refreshed = base.refresh(&infra, &ctx()).await.unwrap();
        assert_eq!(refreshed.power_state(), Some(PowerState::PoweredOff));
        assert_eq!(refreshed.exec_config().id, "abc");
    }

    #[tokio::test]
    async fn test_stop_escalates_to_power_off() {
        let infra = MemoryInfrastructure::new();
        let base = running_base(&infra).await;
        infra.ignore_signals(base.vm().unwrap(), true);

        base.stop(&infra, &ctx(), Duration::from_millis(20), Duration::from_millis(5))
            .await
            .unwrap();

        assert_eq!(infra.call_count(Operation::PowerOff), 1);
        assert_eq!(
            infra.inspect(base.vm().unwrap()).unwrap().runtime.power_state,
            PowerState::PoweredOff
        );
    }

    #[tokio::test]
    async fn test_start_reports_step() {
        let infra = MemoryInfrastructure::new();
        let base = running_base(&infra).await;

        match base.start(&infra, &ctx()).await {
            Err(VesselError::Infra { step, .. }) => assert_eq!(step, Step::Start),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
