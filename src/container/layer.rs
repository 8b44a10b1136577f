//! Committing handles against the platform

use super::base::{instance_uuid, ContainerBase};
use super::cache::{Container, ContainerCache};
use super::handle::Handle;
use super::state::State;
use crate::config::EngineConfig;
use crate::error::{Result, Step, VesselError};
use crate::events::{EventBus, EventKind};
use crate::infra::{Fault, Infrastructure, PowerState, Session, TaskContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The container engine
///
/// Owns the container cache and turns committed handles into platform
/// operations.
pub struct PortLayer {
    infra: Arc<dyn Infrastructure>,
    cache: ContainerCache,
    events: EventBus,
    retry_limit: u32,
    stop_wait: Duration,
    power_poll: Duration,
}

impl PortLayer {
    pub fn new(infra: Arc<dyn Infrastructure>, events: EventBus, config: &EngineConfig) -> Self {
        Self {
            infra,
            cache: ContainerCache::new(),
            events,
            retry_limit: config.reconfigure_retry_limit.max(1),
            stop_wait: config.stop_wait(),
            power_poll: config.power_poll(),
        }
    }

    pub fn cache(&self) -> &ContainerCache {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn evict(&self, id: &str) {
        match self.cache.remove(id) {
            Ok(Some(_)) => info!("Evicted {} from the cache: its VM is gone", id),
            Ok(None) => {}
            Err(e) => warn!("Unable to evict {}: {}", id, e),
        }
    }

    /// Re-read a container's VM into the cache
    ///
    /// The cached state follows power changes made outside the engine,
    /// including a start that failed here but completed on the platform.
    pub async fn refresh(&self, ctx: &TaskContext, container: &Container) -> Result<()> {
        let base = container.base();
        if base.vm().is_none() {
            return Ok(());
        }

        match base.refresh(self.infra.as_ref(), ctx).await {
            Ok(fresh) => {
                let power_state = fresh.power_state();
                let started = fresh.exec_config().has_started();
                container.replace_base(fresh);

                let current = container.current_state();
                let observed = match (power_state, current) {
                    (
                        Some(PowerState::PoweredOn),
                        State::Created | State::Stopped | State::Starting,
                    ) => Some(State::Running),
                    (Some(PowerState::PoweredOff), State::Running | State::Stopping) => {
                        Some(State::Stopped)
                    }
                    (Some(PowerState::PoweredOff), State::Starting) if started => {
                        Some(State::Stopped)
                    }
                    (Some(PowerState::PoweredOff), State::Starting) => Some(State::Created),
                    _ => None,
                };
                if let Some(state) = observed {
                    info!(
                        "{} is {} on the platform, was {}",
                        container.id(),
                        power_state.map(|p| p.to_string()).unwrap_or_default(),
                        current
                    );
                    container.set_state(state);
                }
                Ok(())
            }
            Err(Fault::NotFound(_)) => {
                self.evict(container.id());
                Err(VesselError::NotFound(container.id().to_string()))
            }
            Err(f) => Err(VesselError::infra(container.id(), Step::Refresh, f)),
        }
    }

    /// Refresh a cached container and take a handle on it
    pub async fn get_container(&self, ctx: &TaskContext, id: &str) -> Result<Option<Handle>> {
        let Some(container) = self.cache.get(id)? else {
            return Ok(None);
        };

        self.refresh(ctx, &container).await?;
        Ok(Some(Handle::from_info(container.info())))
    }

    /// Live power state of a container's VM
    pub async fn power_state(&self, ctx: &TaskContext, id: &str) -> Result<PowerState> {
        let container = self
            .cache
            .get(id)?
            .ok_or_else(|| VesselError::NotFound(id.to_string()))?;

        self.refresh(ctx, &container).await?;
        container
            .info()
            .base()
            .power_state()
            .ok_or_else(|| VesselError::MissingVm(id.to_string()))
    }

    /// Apply a handle: create, stop, reconfigure and start, in that order
    ///
    /// Each step only runs when the handle asks for it and stops the commit
    /// when it fails. A not-found fault at any step evicts the container.
    pub async fn commit(
        &self,
        ctx: &TaskContext,
        session: Option<&Session>,
        mut handle: Handle,
        wait_time: Option<Duration>,
    ) -> Result<()> {
        let id = handle.id().to_string();
        let result = self.commit_steps(ctx, session, &mut handle, wait_time).await;

        if let Err(e) = &result {
            if e.is_not_found() {
                self.evict(&id);
            }
        }
        result
    }

    async fn commit_steps(
        &self,
        ctx: &TaskContext,
        session: Option<&Session>,
        handle: &mut Handle,
        wait_time: Option<Duration>,
    ) -> Result<()> {
        let creation = handle.is_creation();
        let container = if creation {
            self.create(ctx, session, handle).await?
        } else {
            self.cache
                .get(handle.id())?
                .ok_or_else(|| VesselError::NotFound(handle.id().to_string()))?
        };

        let mut fresh = false;
        if handle.target_state() == State::Stopped {
            if handle.power_state() == Some(PowerState::PoweredOff) {
                info!("Dropping duplicate power off operation for {}", handle.id());
                if matches!(
                    container.current_state(),
                    State::Running | State::Starting | State::Stopping
                ) {
                    container.set_state(State::Stopped);
                }
            } else {
                self.stop(ctx, &container, handle, wait_time).await?;
                fresh = true;
            }
        }

        handle.stage_exec_config()?;
        if handle.spec().is_some() {
            self.reconfigure(ctx, handle, fresh).await?;
        }

        let started = if handle.target_state() == State::Running {
            if handle.power_state() == Some(PowerState::PoweredOn) {
                info!("Dropping duplicate power on operation for {}", handle.id());
                if matches!(
                    container.current_state(),
                    State::Created | State::Stopped | State::Starting
                ) {
                    container.set_state(State::Running);
                }
                Ok(())
            } else {
                self.start(ctx, &container, handle).await
            }
        } else {
            Ok(())
        };

        if !creation {
            container.refresh_from_handle(handle);
        }
        started
    }

    async fn create(
        &self,
        ctx: &TaskContext,
        session: Option<&Session>,
        handle: &mut Handle,
    ) -> Result<Arc<Container>> {
        let id = handle.id().to_string();
        if handle.spec().is_none() {
            return Err(VesselError::MissingSpec);
        }
        let session = session.ok_or(VesselError::MissingSession)?;
        if self.cache.get(&id)?.is_some() {
            return Err(VesselError::ContainerExists(id));
        }

        handle.stage_exec_config()?;
        let spec = handle.spec_mut();
        spec.name.get_or_insert_with(|| id.clone());
        spec.instance_uuid.get_or_insert_with(|| instance_uuid(&id));
        let spec = spec.clone();

        let placement = session.placement();
        debug!("Creating VM for {} in pool {}", id, placement.pool());
        let vm = ctx
            .wait(self.infra.create_vm(&placement, &spec))
            .await
            .map_err(|f| {
                error!("Failed to create VM for {}: {}", id, f);
                VesselError::infra(&id, Step::Create, f)
            })?;

        handle.base_mut().set_vm(vm);
        handle.clear_spec();

        match handle.base().properties(self.infra.as_ref(), ctx).await {
            Ok(properties) => handle.base_mut().apply_properties(properties),
            Err(f) => warn!("Unable to read back {} after create: {}", id, f),
        }

        let container = Arc::new(Container::new(handle.base().clone()));
        self.cache.put_if_absent(container.clone())?;

        info!("Created container {}", id);
        self.events.publish(&id, EventKind::Created);
        Ok(container)
    }

    async fn stop(
        &self,
        ctx: &TaskContext,
        container: &Container,
        handle: &mut Handle,
        wait_time: Option<Duration>,
    ) -> Result<()> {
        let id = container.id();
        let wait = wait_time.unwrap_or(self.stop_wait);

        // a failed stop stays in Stopping
        container.set_state(State::Stopping);
        handle
            .base()
            .stop(self.infra.as_ref(), ctx, wait, self.power_poll)
            .await?;
        container.set_state(State::Stopped);

        info!("Stopped container {}", id);
        self.events.publish(id, EventKind::Stopped);

        match handle.base().properties(self.infra.as_ref(), ctx).await {
            Ok(properties) => handle.base_mut().apply_properties(properties),
            Err(Fault::NotFound(_)) => return Err(VesselError::NotFound(id.to_string())),
            Err(f) => {
                warn!("Unable to refresh {} after stop: {}", id, f);
                handle.base_mut().set_power_state(PowerState::PoweredOff);
            }
        }
        Ok(())
    }

    /// Apply the pending spec, retrying on concurrent modification
    async fn reconfigure(&self, ctx: &TaskContext, handle: &mut Handle, mut fresh: bool) -> Result<()> {
        let id = handle.id().to_string();
        let (Some(spec), Some(vm)) = (handle.spec().cloned(), handle.base().vm().cloned()) else {
            return Err(VesselError::MissingVm(id));
        };

        let mut conflicts = 0;
        loop {
            if !fresh {
                match handle.base().properties(self.infra.as_ref(), ctx).await {
                    Ok(properties) => handle.base_mut().apply_properties(properties),
                    Err(Fault::NotFound(_)) => return Err(VesselError::NotFound(id)),
                    Err(f) => warn!("Reconfiguring {} with cached change version: {}", id, f),
                }
            }
            fresh = false;

            let mut attempt = spec.clone();
            attempt.change_version = handle.base().change_version().map(str::to_string);
            if handle.power_state() == Some(PowerState::PoweredOn)
                && attempt.extra_config.take().is_some()
            {
                warn!("Dropping extra config from reconfigure of {}: VM is powered on", id);
            }

            match ctx.wait(self.infra.reconfigure_vm(&vm, &attempt)).await {
                Ok(()) => break,
                Err(Fault::ConcurrentAccess(_)) => {
                    conflicts += 1;
                    if conflicts >= self.retry_limit {
                        error!("Giving up on reconfigure of {} after {} conflicts", id, conflicts);
                        return Err(VesselError::ConcurrentAccess {
                            id,
                            attempts: conflicts,
                        });
                    }
                    warn!(
                        "Concurrent modification of {}, retrying ({}/{})",
                        id, conflicts, self.retry_limit
                    );
                }
                Err(f) => {
                    error!("Failed to reconfigure {}: {}", id, f);
                    return Err(VesselError::infra(&id, Step::Reconfigure, f));
                }
            }
        }

        handle.clear_spec();
        debug!("Reconfigured {}", id);

        match handle.base().properties(self.infra.as_ref(), ctx).await {
            Ok(properties) => handle.base_mut().apply_properties(properties),
            Err(Fault::NotFound(_)) => return Err(VesselError::NotFound(id)),
            Err(f) => warn!("Unable to refresh {} after reconfigure: {}", id, f),
        }
        Ok(())
    }

    async fn start(&self, ctx: &TaskContext, container: &Container, handle: &mut Handle) -> Result<()> {
        // a failed start stays in Starting
        container.set_state(State::Starting);
        handle.base().start(self.infra.as_ref(), ctx).await?;
        handle.base_mut().set_power_state(PowerState::PoweredOn);
        container.set_state(State::Running);

        info!("Started container {}", container.id());
        self.events.publish(container.id(), EventKind::Started);
        Ok(())
    }

    /// Delete a container's VM and drop it from the cache
    ///
    /// A VM the platform refuses to delete because of its state is
    /// unregistered instead.
    pub async fn remove(
        &self,
        ctx: &TaskContext,
        container: &Container,
        session: Option<&Session>,
    ) -> Result<()> {
        let id = container.id().to_string();
        let base = container.base();
        let vm = base
            .vm()
            .cloned()
            .ok_or_else(|| VesselError::MissingVm(id.clone()))?;

        if container.current_state() == State::Running {
            return Err(VesselError::RemovePower(id));
        }

        let previous = container.set_state(State::Removing);
        match ctx.wait(self.infra.delete_vm(&vm)).await {
            Ok(()) => {}
            Err(Fault::NotFound(_)) => {
                self.evict(&id);
                return Err(VesselError::NotFound(id));
            }
            Err(Fault::InvalidState(msg)) => {
                warn!("{} is in an invalid state ({}), unregistering", id, msg);
                if let Err(f) = ctx.wait(self.infra.unregister_vm(&vm)).await {
                    error!("Failed to unregister {}: {}", id, f);
                    return Err(VesselError::infra(&id, Step::Remove, f));
                }
            }
            Err(f) => {
                error!("Failed to delete {}: {}", id, f);
                container.set_state(previous);
                return Err(VesselError::infra(&id, Step::Remove, f));
            }
        }

        if let Some(session) = session {
            if let Err(f) = ctx.wait(self.infra.delete_files(&session.datacenter, &vm)).await {
                debug!("Leaving datastore files of {}: {}", id, f);
            }
        }

        container.set_state(State::Removed);
        self.cache.remove(&id)?;

        info!("Removed container {}", id);
        self.events.publish(&id, EventKind::Removed);
        Ok(())
    }

    /// Rebuild the cache from the VMs in the session's resource pool
    ///
    /// Returns how many containers were added. VMs without a container ID
    /// are skipped.
    pub async fn sync(&self, ctx: &TaskContext, session: &Session) -> Result<usize> {
        let pool = session.placement().pool().to_string();
        let vms = ctx
            .wait(self.infra.pool_vms(&pool))
            .await
            .map_err(|f| VesselError::infra(&pool, Step::Refresh, f))?;

        let mut recovered = 0;
        for vm in vms {
            let properties = match ctx.wait(self.infra.properties(&vm)).await {
                Ok(properties) => properties,
                Err(f) => {
                    warn!("Skipping {} during recovery: {}", vm, f);
                    continue;
                }
            };
            let base = match ContainerBase::from_vm(vm.clone(), properties) {
                Ok(base) => base,
                Err(e) => {
                    warn!("Skipping {} during recovery: {}", vm, e);
                    continue;
                }
            };

            let id = base.id().to_string();
            match self.cache.get(&id)? {
                Some(existing) => existing.replace_base(base),
                None => {
                    let container = Arc::new(Container::new(base));
                    debug!("Recovered {} as {}", id, container.current_state());
                    self.cache.put(container)?;
                    recovered += 1;
                }
            }
        }

        info!("Recovered {} container(s) from pool {}", recovered, pool);
        Ok(recovered)
    }
}
