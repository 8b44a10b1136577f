//! Docker-personality container backend
//!
//! Turns container requests into handle commits and keeps each container's
//! network endpoints and published host ports in step with its power state:
//! ports are mapped while a container runs and released when it stops.

mod request;
mod rollback;

pub use request::{generate_name, validate_name, CreateRequest};

use crate::config::EngineConfig;
use crate::container::{ExecConfig, Handle, PortLayer, State};
use crate::error::{Result, VesselError};
use crate::events::EventBus;
use crate::infra::{Infrastructure, PowerState, Session, TaskContext, VmSpec};
use crate::network::{EndpointConfig, EndpointInfo, NetworkContext, Port, ScopeType};
use crate::portmap::{PortBinding, PortMapper, PortMappings};
use chrono::{DateTime, Utc};
use rollback::Rollback;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Annotation carrying a container's record, so it survives a restart
pub const HOST_CONFIG_KEY: &str = "vessel.host_config";

/// Attempts at finding an unused generated name
const NAME_ATTEMPTS: usize = 16;

/// What the backend remembers about a container beyond its VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Scope the container is attached to
    pub network: String,
    /// Published ports, host ports resolved at create
    pub port_bindings: Vec<PortBinding>,
    pub created_at: DateTime<Utc>,
}

/// Container details returned by inspect and list
#[derive(Debug, Clone, Serialize)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: State,
    pub power_state: Option<PowerState>,
    pub created_at: DateTime<Utc>,
    pub network: String,
    pub port_bindings: Vec<PortBinding>,
    pub endpoints: Vec<EndpointInfo>,
}

/// Container backend
pub struct ContainerBackend {
    config: EngineConfig,
    session: Session,
    layer: PortLayer,
    network: NetworkContext,
    ports: PortMappings,
    records: RwLock<HashMap<String, ContainerRecord>>,
    /// Resolved name of the default scope
    default_scope: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl ContainerBackend {
    pub fn new(
        config: EngineConfig,
        infra: Arc<dyn Infrastructure>,
        mapper: Arc<dyn PortMapper>,
        session: Session,
    ) -> Result<Self> {
        config.validate()?;

        let layer = PortLayer::new(infra, EventBus::new(), &config);
        let network = NetworkContext::new(&config.bridge)?;
        let ports = PortMappings::new(mapper, &config);

        Ok(Self {
            config,
            session,
            layer,
            network,
            ports,
            records: RwLock::new(HashMap::new()),
            default_scope: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layer(&self) -> &PortLayer {
        &self.layer
    }

    pub fn network(&self) -> &NetworkContext {
        &self.network
    }

    pub fn ports(&self) -> &PortMappings {
        &self.ports
    }

    pub fn events(&self) -> &EventBus {
        self.layer.events()
    }

    /// Cancel every infrastructure task still in flight
    pub fn shutdown(&self) {
        info!("Shutting down container backend");
        self.cancel.cancel();
    }

    fn task_context(&self) -> TaskContext {
        TaskContext::with_cancel(self.config.task_timeout(), self.cancel.child_token())
    }

    fn read_records(&self) -> Result<RwLockReadGuard<'_, HashMap<String, ContainerRecord>>> {
        self.records
            .read()
            .map_err(|_| VesselError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write_records(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, ContainerRecord>>> {
        self.records
            .write()
            .map_err(|_| VesselError::Lock("Failed to acquire write lock".to_string()))
    }

    fn record(&self, id: &str) -> Result<ContainerRecord> {
        self.read_records()?
            .get(id)
            .cloned()
            .ok_or_else(|| VesselError::NotFound(id.to_string()))
    }

    /// Resolve a container ID, name or unique ID prefix
    pub fn find(&self, name_or_id: &str) -> Result<String> {
        let records = self.read_records()?;
        if records.contains_key(name_or_id) {
            return Ok(name_or_id.to_string());
        }
        if let Some(record) = records.values().find(|r| r.name == name_or_id) {
            return Ok(record.id.clone());
        }

        let matches: Vec<&String> = records
            .keys()
            .filter(|id| !name_or_id.is_empty() && id.starts_with(name_or_id))
            .collect();
        match matches.as_slice() {
            [id] => Ok((*id).clone()),
            [] => Err(VesselError::NotFound(name_or_id.to_string())),
            _ => Err(VesselError::InvalidRequest(format!(
                "{} matches {} containers",
                name_or_id,
                matches.len()
            ))),
        }
    }

    fn name_in_use(&self, name: &str) -> Result<bool> {
        Ok(self.read_records()?.values().any(|r| r.name == name))
    }

    fn unique_name(&self) -> Result<String> {
        for _ in 0..NAME_ATTEMPTS {
            let name = generate_name();
            if !self.name_in_use(&name)? {
                return Ok(name);
            }
        }
        let suffix = Uuid::new_v4().to_string().replace("-", "");
        Ok(format!("{}_{}", generate_name(), &suffix[..6]))
    }

    /// Name of the default scope, looked up once
    fn default_scope(&self) -> Result<String> {
        let mut cached = self.default_scope.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(name) = cached.as_ref() {
            return Ok(name.clone());
        }
        let name = self.network.default_scope()?;
        *cached = Some(name.clone());
        Ok(name)
    }

    fn scope_for(&self, network_mode: Option<&str>) -> Result<String> {
        match network_mode {
            None | Some("") | Some("default") => self.default_scope(),
            Some(mode) => self.network.resolve_scope(mode),
        }
    }

    /// Drop a container the platform no longer has, along with its ports and endpoints
    fn forget(&self, id: &str) {
        if let Err(e) = self.ports.unmap_container(id) {
            warn!("Unable to unmap ports of {}: {}", id, e);
        }
        if let Err(e) = self.network.remove_container_endpoints(id) {
            warn!("Unable to remove endpoints of {}: {}", id, e);
        }

        let record = match self.write_records() {
            Ok(mut records) => records.remove(id),
            Err(e) => {
                warn!("Unable to drop record of {}: {}", id, e);
                None
            }
        };

        // host ports allocated at create but never mapped
        if let Some(record) = record {
            for binding in &record.port_bindings {
                if let Some(port) = binding.host_port {
                    if matches!(self.ports.owner(binding.protocol(), port), Ok(None)) {
                        self.ports.allocator().release(binding.protocol(), port);
                    }
                }
            }
            debug!("Dropped record of {}", id);
        }
    }

    fn forget_if_gone(&self, id: &str, error: VesselError) -> VesselError {
        if error.is_not_found() {
            self.forget(id);
        }
        error
    }

    /// Refresh a container and take a handle on it
    async fn handle(&self, ctx: &TaskContext, id: &str) -> Result<Handle> {
        match self.layer.get_container(ctx, id).await {
            Ok(Some(handle)) => Ok(handle),
            Ok(None) => Err(self.forget_if_gone(id, VesselError::NotFound(id.to_string()))),
            Err(e) => Err(self.forget_if_gone(id, e)),
        }
    }

    /// Create a container; nothing reaches the platform if the request is invalid
    pub async fn create_container(&self, request: CreateRequest) -> Result<String> {
        let mut bindings = request.validate(&self.config.external_addresses)?;

        let name = match &request.name {
            Some(name) => {
                if self.name_in_use(name)? {
                    return Err(VesselError::InvalidRequest(format!(
                        "name {} is already in use",
                        name
                    )));
                }
                name.clone()
            }
            None => self.unique_name()?,
        };
        let scope = self.scope_for(request.network_mode.as_deref())?;

        let id = Uuid::new_v4().to_string().replace("-", "");

        let requested: Vec<Option<u16>> = bindings.iter().map(|b| b.host_port).collect();
        self.ports.unroll(&mut bindings)?;
        let allocated: Vec<PortBinding> = bindings
            .iter()
            .zip(&requested)
            .filter(|(_, requested)| requested.is_none())
            .map(|(binding, _)| binding.clone())
            .collect();
        let release = Rollback::new(|| {
            for binding in &allocated {
                if let Some(port) = binding.host_port {
                    self.ports.allocator().release(binding.protocol(), port);
                }
            }
        });

        let mut exposed: Vec<Port> = request.exposed_ports()?;
        for binding in &bindings {
            if !exposed.contains(&binding.container_port) {
                exposed.push(binding.container_port);
            }
        }
        let endpoint = EndpointConfig {
            static_ip: request.ip_address,
            assigned_ip: None,
            ports: exposed,
            aliases: request.aliases.clone(),
        };

        let record = ContainerRecord {
            id: id.clone(),
            name: name.clone(),
            image: request.image.clone(),
            network: scope.clone(),
            port_bindings: bindings,
            created_at: Utc::now(),
        };

        let mut exec_config = ExecConfig::new(&id, &name, &request.image)
            .cmd(request.cmd.clone().unwrap_or_default())
            .network(&scope, endpoint);
        exec_config.entrypoint = request.entrypoint.clone().unwrap_or_default();
        exec_config.env = request.env_map();
        exec_config.working_dir = request.working_dir.clone().unwrap_or_default();
        exec_config.user = request.user.clone().unwrap_or_default();
        exec_config.created_at = Some(record.created_at);
        exec_config
            .annotations
            .insert(HOST_CONFIG_KEY.to_string(), serde_json::to_string(&record)?);

        let spec = VmSpec {
            name: Some(format!("{}-{}", name, &id[..12])),
            num_cpus: request.num_cpus,
            memory_mb: request.memory_mb,
            ..VmSpec::default()
        };

        let ctx = self.task_context();
        let handle = Handle::new(exec_config).with_spec(spec);
        self.layer.commit(&ctx, Some(&self.session), handle, None).await?;
        release.disarm();

        info!("Created container {} ({})", name, id);
        self.write_records()?.insert(id.clone(), record);
        Ok(id)
    }

    /// Bind a container's network, publish its ports and power it on
    ///
    /// A container whose VM is already powered on still gets its endpoints
    /// and mappings; the commit then only records it as running. A failure
    /// at any point undoes the endpoints and mappings made so far.
    pub async fn start_container(&self, id: &str) -> Result<()> {
        let record = self.record(id)?;
        let ctx = self.task_context();
        let mut handle = self.handle(&ctx, id).await?;

        let endpoints = self.network.bind_container(&mut handle)?;
        let unbind = Rollback::new(|| {
            if let Err(e) = self.network.remove_container_endpoints(id) {
                warn!("Unable to roll back endpoints of {}: {}", id, e);
            }
        });

        self.reclaim_ports(&ctx, &record).await?;
        handle.set_target_state(State::Running);
        if handle.power_state() != Some(PowerState::PoweredOn) {
            if let Some(session) = handle.exec_config_mut().sessions.get_mut(id) {
                session.started = Some(Utc::now());
            }
        }

        let mut unmap = None;
        if !record.port_bindings.is_empty() {
            match endpoints.iter().find(|e| e.scope == record.network) {
                Some(endpoint) if endpoint.scope_type == ScopeType::Bridge => {
                    let mut bindings = record.port_bindings.clone();
                    if let Err(e) = self.ports.map_ports(&mut bindings, endpoint.ip, id) {
                        if let Err(u) = self.ports.unmap_ports(&bindings, id) {
                            warn!("Unable to undo partial mapping of {}: {}", id, u);
                        }
                        return Err(e);
                    }
                    unmap = Some(Rollback::new(move || {
                        if let Err(e) = self.ports.unmap_ports(&bindings, id) {
                            warn!("Unable to roll back ports of {}: {}", id, e);
                        }
                    }));
                }
                Some(endpoint) => {
                    debug!(
                        "{} is on {} scope {}, no ports to map",
                        id, endpoint.scope_type, endpoint.scope
                    );
                }
                None => {
                    return Err(VesselError::Network(format!(
                        "{} has no endpoint on {} to publish ports on",
                        id, record.network
                    )));
                }
            }
        }

        self.layer
            .commit(&ctx, Some(&self.session), handle, None)
            .await
            .map_err(|e| self.forget_if_gone(id, e))?;

        if let Some(unmap) = unmap {
            unmap.disarm();
        }
        unbind.disarm();
        Ok(())
    }

    /// Take back host ports this container needs from owners that are not running
    async fn reclaim_ports(&self, ctx: &TaskContext, record: &ContainerRecord) -> Result<()> {
        for binding in &record.port_bindings {
            let Some(port) = binding.host_port else {
                continue;
            };
            let Some(owner) = self.ports.owner(binding.protocol(), port)? else {
                continue;
            };
            if owner == record.id {
                continue;
            }

            let running = match self.layer.power_state(ctx, &owner).await {
                Ok(power_state) => power_state == PowerState::PoweredOn,
                Err(e) if e.is_not_found() => {
                    info!("Reclaiming ports of {}: its VM is gone", owner);
                    self.forget(&owner);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if running {
                debug!("{}/{} stays with running container {}", port, binding.protocol(), owner);
                continue;
            }

            info!(
                "Reclaiming {}/{} from {}: it is no longer running",
                port,
                binding.protocol(),
                owner
            );
            self.ports.unmap_container(&owner)?;
        }
        Ok(())
    }

    /// Release host ports held by stopped or missing containers that `id` publishes
    pub async fn cleanup_port_bindings(&self, id: &str) -> Result<()> {
        let record = self.record(id)?;
        let ctx = self.task_context();
        self.reclaim_ports(&ctx, &record).await
    }

    /// Unpublish a container's ports, unbind its network and power it off
    pub async fn stop_container(&self, id: &str, wait: Option<Duration>) -> Result<()> {
        let record = self.record(id)?;
        let ctx = self.task_context();
        let mut handle = self.handle(&ctx, id).await?;

        if handle.state().is_stopped() {
            info!("{} is already stopped", id);
            self.network.remove_container_endpoints(id)?;
            self.ports.unmap_ports(&record.port_bindings, id)?;
            return Ok(());
        }

        match self.network.unbind_container(&mut handle) {
            Ok(_) => {}
            Err(VesselError::NotFound(_)) => debug!("{} had no endpoints to unbind", id),
            Err(e) => return Err(e),
        }
        self.ports.unmap_ports(&record.port_bindings, id)?;

        handle.set_target_state(State::Stopped);
        self.layer
            .commit(&ctx, Some(&self.session), handle, wait)
            .await
            .map_err(|e| self.forget_if_gone(id, e))
    }

    /// Delete a container; `force` stops a running container first
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        self.record(id)?;
        if force {
            if let Err(e) = self.stop_container(id, None).await {
                warn!("Forced stop of {} failed: {}", id, e);
            }
        }

        let ctx = self.task_context();
        let Some(container) = self.layer.cache().get(id)? else {
            self.forget(id);
            return Err(VesselError::NotFound(id.to_string()));
        };

        self.layer
            .refresh(&ctx, &container)
            .await
            .map_err(|e| self.forget_if_gone(id, e))?;
        self.layer
            .remove(&ctx, &container, Some(&self.session))
            .await
            .map_err(|e| self.forget_if_gone(id, e))?;

        self.forget(id);
        info!("Removed container {}", id);
        Ok(())
    }

    /// Whether the container's VM is powered on right now
    pub async fn is_running(&self, id: &str) -> Result<bool> {
        let ctx = self.task_context();
        match self.layer.power_state(&ctx, id).await {
            Ok(power_state) => Ok(power_state == PowerState::PoweredOn),
            Err(e) => Err(self.forget_if_gone(id, e)),
        }
    }

    fn view(
        &self,
        record: ContainerRecord,
        state: State,
        power_state: Option<PowerState>,
    ) -> Result<ContainerView> {
        Ok(ContainerView {
            endpoints: self.network.container_endpoints(&record.id)?,
            id: record.id,
            name: record.name,
            image: record.image,
            state,
            power_state,
            created_at: record.created_at,
            network: record.network,
            port_bindings: record.port_bindings,
        })
    }

    /// Current details of one container
    pub async fn inspect(&self, id: &str) -> Result<ContainerView> {
        let record = self.record(id)?;
        let ctx = self.task_context();
        let handle = self.handle(&ctx, id).await?;
        self.view(record, handle.state(), handle.power_state())
    }

    /// Cached details of every container, or only the running ones
    pub fn list(&self, all: bool) -> Result<Vec<ContainerView>> {
        let records: Vec<ContainerRecord> = self.read_records()?.values().cloned().collect();

        let mut views = Vec::with_capacity(records.len());
        for record in records {
            let Some(container) = self.layer.cache().get(&record.id)? else {
                continue;
            };
            let info = container.info();
            if !all && info.state() != State::Running {
                continue;
            }
            views.push(self.view(record, info.state(), info.base().power_state())?);
        }

        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(views)
    }

    /// Rebuild state from the VMs already on the platform
    ///
    /// Running containers get their endpoints and port mappings back.
    /// Returns how many containers were recovered.
    pub async fn recover(&self) -> Result<usize> {
        let ctx = self.task_context();
        let recovered = self.layer.sync(&ctx, &self.session).await?;

        for container in self.layer.cache().list()? {
            let info = container.info();
            let id = info.id().to_string();
            if self.read_records()?.contains_key(&id) {
                continue;
            }

            let record = match info.base().exec_config().annotations.get(HOST_CONFIG_KEY) {
                Some(json) => match serde_json::from_str::<ContainerRecord>(json) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Skipping {}: unreadable host config: {}", id, e);
                        continue;
                    }
                },
                None => {
                    debug!("Skipping {}: no host config", id);
                    continue;
                }
            };

            for binding in &record.port_bindings {
                if let Some(port) = binding.host_port {
                    if self.ports.allocator().range().contains(port) {
                        self.ports.allocator().reserve(binding.protocol(), port);
                    }
                }
            }

            if info.state() == State::Running {
                let mut handle = Handle::from_info(info);
                match self.network.bind_container(&mut handle) {
                    Ok(endpoints) => {
                        let bridge = endpoints
                            .iter()
                            .find(|e| e.scope == record.network && e.scope_type == ScopeType::Bridge);
                        if let Some(endpoint) = bridge {
                            let mut bindings = record.port_bindings.clone();
                            if let Err(e) = self.ports.map_ports(&mut bindings, endpoint.ip, &id) {
                                warn!("Unable to restore ports of {}: {}", id, e);
                            }
                        }
                    }
                    Err(e) => warn!("Unable to restore network of {}: {}", id, e),
                }
            }

            debug!("Recovered record of {} ({})", record.name, id);
            self.write_records()?.insert(id, record);
        }

        info!("Recovered {} container(s)", recovered);
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::infra::{MemoryInfrastructure, Operation};
    use crate::network::Protocol;
    use crate::portmap::MemoryPortMapper;
    use std::net::Ipv4Addr;

    struct Fixture {
        infra: Arc<MemoryInfrastructure>,
        mapper: Arc<MemoryPortMapper>,
        backend: ContainerBackend,
    }

    fn config() -> EngineConfig {
        EngineConfig {
            ephemeral_ports: PortRange {
                start: 49153,
                end: 49160,
            },
            power_poll_ms: 5,
            stop_wait_secs: 1,
            external_addresses: vec![Ipv4Addr::new(10, 0, 0, 5)],
            ..EngineConfig::default()
        }
    }

    fn session() -> Session {
        Session::new("dc", "pool", "vm")
    }

    fn fixture() -> Fixture {
        let infra = Arc::new(MemoryInfrastructure::new());
        let mapper = Arc::new(MemoryPortMapper::new());
        let backend =
            ContainerBackend::new(config(), infra.clone(), mapper.clone(), session()).unwrap();
        Fixture {
            infra,
            mapper,
            backend,
        }
    }

    fn request(name: &str, publish: &[&str]) -> CreateRequest {
        let mut request = CreateRequest::new("nginx", &["nginx"]);
        request.name = Some(name.to_string());
        request.port_bindings = publish.iter().map(|p| p.to_string()).collect();
        request
    }

    fn vm_of(backend: &ContainerBackend, id: &str) -> crate::infra::VmRef {
        let container = backend.layer().cache().get(id).unwrap().unwrap();
        let info = container.info();
        info.base().vm().unwrap().clone()
    }

    #[tokio::test]
    async fn test_ephemeral_port_lifecycle() {
        let f = fixture();
        let id = f.backend.create_container(request("web", &["80"])).await.unwrap();

        let record = f.backend.record(&id).unwrap();
        let port = record.port_bindings[0].host_port.unwrap();
        assert!(config().ephemeral_ports.contains(port));
        assert!(f.mapper.rule(Protocol::Tcp, port).is_none());

        f.backend.start_container(&id).await.unwrap();
        let rule = f.mapper.rule(Protocol::Tcp, port).unwrap();
        assert_eq!(rule.container_port, 80);
        assert_eq!(f.backend.ports().owner(Protocol::Tcp, port).unwrap(), Some(id.clone()));

        let view = f.backend.inspect(&id).await.unwrap();
        assert_eq!(view.state, State::Running);
        assert_eq!(view.endpoints.len(), 1);
        assert_eq!(rule.container_ip, view.endpoints[0].ip);

        f.backend.stop_container(&id, None).await.unwrap();
        assert!(f.mapper.rule(Protocol::Tcp, port).is_none());
        assert_eq!(f.backend.ports().owner(Protocol::Tcp, port).unwrap(), None);
        assert!(!f.backend.ports().allocator().is_allocated(Protocol::Tcp, port));
        assert!(f.backend.network().container_endpoints(&id).unwrap().is_empty());

        let publish = format!("{}:80", port);
        let other = f
            .backend
            .create_container(request("web2", &[publish.as_str()]))
            .await
            .unwrap();
        f.backend.start_container(&other).await.unwrap();
        assert_eq!(f.backend.ports().owner(Protocol::Tcp, port).unwrap(), Some(other));
    }

    #[tokio::test]
    async fn test_port_conflict_then_reclaim() {
        let f = fixture();
        let c2 = f.backend.create_container(request("c2", &["8083:80"])).await.unwrap();
        let c3 = f.backend.create_container(request("c3", &["8083:80"])).await.unwrap();
        f.backend.start_container(&c2).await.unwrap();

        match f.backend.start_container(&c3).await {
            Err(VesselError::PortUnavailable { owner, .. }) => assert_eq!(owner, c2),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(f.backend.network().container_endpoints(&c3).unwrap().is_empty());
        assert!(!f.backend.is_running(&c3).await.unwrap());

        f.infra.set_power_state(&vm_of(&f.backend, &c2), PowerState::PoweredOff);
        f.backend.start_container(&c3).await.unwrap();

        assert_eq!(f.backend.ports().owner(Protocol::Tcp, 8083).unwrap(), Some(c3.clone()));
        assert_eq!(
            f.mapper.rule(Protocol::Tcp, 8083).unwrap().container_ip,
            f.backend.network().container_endpoints(&c3).unwrap()[0].ip
        );
        assert!(f.backend.is_running(&c3).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_leaves_running_owner() {
        let f = fixture();
        let c1 = f.backend.create_container(request("c1", &["8090:80"])).await.unwrap();
        let c2 = f.backend.create_container(request("c2", &["8090:80"])).await.unwrap();
        f.backend.start_container(&c1).await.unwrap();

        f.backend.cleanup_port_bindings(&c2).await.unwrap();
        assert_eq!(f.backend.ports().owner(Protocol::Tcp, 8090).unwrap(), Some(c1));
    }

    #[tokio::test]
    async fn test_invalid_requests_make_no_remote_call() {
        let f = fixture();

        let mut no_cmd = request("a", &[]);
        no_cmd.cmd = None;
        let mut user = request("b", &[]);
        user.user = Some("nobody".to_string());
        let foreign_ip = request("c", &["192.168.1.1:80:80"]);
        let range = request("d", &["8000-8002:80"]);
        let mut network = request("e", &[]);
        network.network_mode = Some("missing".to_string());

        for bad in [no_cmd, user, foreign_ip, range, network] {
            assert!(f.backend.create_container(bad).await.is_err());
        }
        assert_eq!(f.infra.call_count(Operation::Create), 0);
        assert!(f.backend.list(true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let f = fixture();
        f.backend.create_container(request("web", &[])).await.unwrap();
        assert!(f.backend.create_container(request("web", &[])).await.is_err());
        assert_eq!(f.infra.call_count(Operation::Create), 1);
    }

    #[tokio::test]
    async fn test_generated_name_and_lookup() {
        let f = fixture();
        let mut unnamed = request("x", &[]);
        unnamed.name = None;
        let id = f.backend.create_container(unnamed).await.unwrap();

        let record = f.backend.record(&id).unwrap();
        validate_name(&record.name).unwrap();
        assert_eq!(f.backend.find(&record.name).unwrap(), id);
        assert_eq!(f.backend.find(&id[..8]).unwrap(), id);
        assert!(f.backend.find("nope").is_err());

        let vm = vm_of(&f.backend, &id);
        let name = f.infra.inspect(&vm).unwrap().config.name;
        assert_eq!(name, format!("{}-{}", record.name, &id[..12]));
    }

    #[tokio::test]
    async fn test_failed_create_releases_ephemeral_ports() {
        let f = fixture();
        f.infra
            .inject_fault(Operation::Create, crate::infra::Fault::Other("datastore full".into()));

        assert!(f.backend.create_container(request("web", &["80"])).await.is_err());
        assert!(!f.backend.ports().allocator().is_allocated(Protocol::Tcp, 49153));
    }

    #[tokio::test]
    async fn test_map_failure_rolls_back_bind() {
        let f = fixture();
        f.mapper.fail_on(8084);
        let id = f
            .backend
            .create_container(request("web", &["8085:81", "8084:80"]))
            .await
            .unwrap();

        assert!(f.backend.start_container(&id).await.is_err());
        assert!(f.backend.network().container_endpoints(&id).unwrap().is_empty());
        assert!(f.mapper.installed().is_empty());
        assert!(f.backend.ports().owned_ports(&id).unwrap().is_empty());
        assert_eq!(f.infra.call_count(Operation::PowerOn), 0);
    }

    #[tokio::test]
    async fn test_failed_power_on_releases_ports() {
        let f = fixture();
        let id = f.backend.create_container(request("web", &["8086:80"])).await.unwrap();
        f.infra
            .inject_fault(Operation::PowerOn, crate::infra::Fault::Other("no host".into()));

        assert!(f.backend.start_container(&id).await.is_err());
        assert!(f.mapper.installed().is_empty());
        assert!(f.backend.network().container_endpoints(&id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_maps_ports_of_vm_already_powered_on() {
        let f = fixture();
        let id = f.backend.create_container(request("web", &["8089:80"])).await.unwrap();
        f.infra
            .inject_fault(Operation::PowerOn, crate::infra::Fault::Other("no host".into()));
        assert!(f.backend.start_container(&id).await.is_err());

        f.infra.set_power_state(&vm_of(&f.backend, &id), PowerState::PoweredOn);
        f.backend.start_container(&id).await.unwrap();

        assert_eq!(f.infra.call_count(Operation::PowerOn), 1);
        assert!(f.mapper.rule(Protocol::Tcp, 8089).is_some());
        assert_eq!(f.backend.ports().owner(Protocol::Tcp, 8089).unwrap(), Some(id.clone()));
        assert_eq!(f.backend.network().container_endpoints(&id).unwrap().len(), 1);
        let container = f.backend.layer().cache().get(&id).unwrap().unwrap();
        assert_eq!(container.current_state(), State::Running);
        assert_eq!(f.backend.inspect(&id).await.unwrap().state, State::Running);
    }

    #[tokio::test]
    async fn test_stop_after_out_of_band_power_on() {
        let f = fixture();
        let id = f.backend.create_container(request("web", &[])).await.unwrap();
        f.backend.start_container(&id).await.unwrap();
        f.backend.stop_container(&id, None).await.unwrap();

        let vm = vm_of(&f.backend, &id);
        f.infra.set_power_state(&vm, PowerState::PoweredOn);
        assert!(f.backend.is_running(&id).await.unwrap());

        let stops = f.infra.call_count(Operation::Signal) + f.infra.call_count(Operation::PowerOff);
        f.backend.stop_container(&id, None).await.unwrap();

        assert!(
            f.infra.call_count(Operation::Signal) + f.infra.call_count(Operation::PowerOff) > stops
        );
        assert_eq!(f.infra.inspect(&vm).unwrap().runtime.power_state, PowerState::PoweredOff);
        assert_eq!(f.backend.inspect(&id).await.unwrap().state, State::Stopped);
    }

    #[tokio::test]
    async fn test_reclaim_from_vanished_owner() {
        let f = fixture();
        let c1 = f.backend.create_container(request("c1", &["8091:80"])).await.unwrap();
        let c2 = f.backend.create_container(request("c2", &["8091:80"])).await.unwrap();
        f.backend.start_container(&c1).await.unwrap();

        f.infra.remove_out_of_band(&vm_of(&f.backend, &c1));
        f.backend.start_container(&c2).await.unwrap();

        assert_eq!(f.backend.ports().owner(Protocol::Tcp, 8091).unwrap(), Some(c2.clone()));
        assert!(f.backend.find("c1").is_err());
        assert!(f.backend.network().container_endpoints(&c1).unwrap().is_empty());
        let all = f.backend.list(true).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, c2);
    }

    #[tokio::test]
    async fn test_remove_running_requires_force() {
        let f = fixture();
        let id = f.backend.create_container(request("web", &["8087:80"])).await.unwrap();
        f.backend.start_container(&id).await.unwrap();

        assert!(matches!(
            f.backend.remove_container(&id, false).await,
            Err(VesselError::RemovePower(_))
        ));

        f.backend.remove_container(&id, true).await.unwrap();
        assert!(f.backend.find(&id).is_err());
        assert!(f.backend.layer().cache().is_empty());
        assert!(f.mapper.installed().is_empty());
        assert_eq!(f.infra.vm_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_of_stopped_container_is_quiet() {
        let f = fixture();
        let id = f.backend.create_container(request("web", &[])).await.unwrap();

        f.backend.stop_container(&id, None).await.unwrap();
        assert_eq!(f.infra.call_count(Operation::Signal), 0);
        assert_eq!(f.infra.call_count(Operation::PowerOff), 0);
    }

    #[tokio::test]
    async fn test_vanished_vm_drops_record() {
        let f = fixture();
        let id = f.backend.create_container(request("web", &["80"])).await.unwrap();
        f.infra.remove_out_of_band(&vm_of(&f.backend, &id));

        assert!(matches!(
            f.backend.start_container(&id).await,
            Err(VesselError::NotFound(_))
        ));
        assert!(f.backend.find("web").is_err());
        assert!(!f.backend.ports().allocator().is_allocated(Protocol::Tcp, 49153));
    }

    #[tokio::test]
    async fn test_list_filters_running() {
        let f = fixture();
        let a = f.backend.create_container(request("a", &[])).await.unwrap();
        f.backend.create_container(request("b", &[])).await.unwrap();
        f.backend.start_container(&a).await.unwrap();

        assert_eq!(f.backend.list(true).unwrap().len(), 2);
        let running = f.backend.list(false).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a);
    }

    #[tokio::test]
    async fn test_recover_rebuilds_records_and_ports() {
        let f = fixture();
        let id = f.backend.create_container(request("web", &["8088:80"])).await.unwrap();
        f.backend.create_container(request("idle", &[])).await.unwrap();
        f.backend.start_container(&id).await.unwrap();

        let mapper = Arc::new(MemoryPortMapper::new());
        let restarted =
            ContainerBackend::new(config(), f.infra.clone(), mapper.clone(), session()).unwrap();
        assert_eq!(restarted.recover().await.unwrap(), 2);

        assert_eq!(restarted.find("web").unwrap(), id);
        assert!(restarted.find("idle").is_ok());
        assert_eq!(restarted.ports().owner(Protocol::Tcp, 8088).unwrap(), Some(id.clone()));
        assert!(mapper.rule(Protocol::Tcp, 8088).is_some());
        assert!(restarted.is_running(&id).await.unwrap());

        restarted.stop_container(&id, None).await.unwrap();
        assert!(mapper.installed().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_tasks() {
        let f = fixture();
        f.backend.shutdown();
        assert!(f.backend.create_container(request("web", &[])).await.is_err());
    }
}
