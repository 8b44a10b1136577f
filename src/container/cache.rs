//! Container cache and per-container state

use super::base::ContainerBase;
use super::handle::Handle;
use super::state::State;
use crate::error::{Result, VesselError};
use crate::infra::PowerState;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::watch;
use tracing::{debug, warn};

/// One-shot notification that a container reached a state
#[derive(Debug)]
pub struct StateWaiter {
    rx: watch::Receiver<bool>,
}

impl StateWaiter {
    fn fired() -> Self {
        let (_, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the state; false if the container went away first
    pub async fn wait(mut self) -> bool {
        self.rx.wait_for(|reached| *reached).await.is_ok()
    }
}

struct Inner {
    base: ContainerBase,
    state: State,
    waiters: HashMap<State, watch::Sender<bool>>,
}

impl Inner {
    fn update_state(&mut self, state: State) -> State {
        let previous = self.state;
        self.state = state;
        if let Some(tx) = self.waiters.remove(&state) {
            tx.send_replace(true);
        }
        previous
    }
}

/// A cached container
///
/// The lock is only ever held for in-memory updates, never across a call
/// to the platform.
pub struct Container {
    id: String,
    inner: Mutex<Inner>,
}

/// Snapshot of a container taken under its lock
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    base: ContainerBase,
    state: State,
}

impl ContainerInfo {
    pub fn id(&self) -> &str {
        self.base.id()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn base(&self) -> &ContainerBase {
        &self.base
    }

    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id().to_string(),
            name: self.base.exec_config().name.clone(),
            image: self.base.exec_config().image.clone(),
            state: self.state,
            power_state: self.base.power_state(),
            vm: self.base.vm().map(|vm| vm.to_string()),
        }
    }
}

/// Serializable view of a cached container
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: State,
    pub power_state: Option<PowerState>,
    pub vm: Option<String>,
}

impl Container {
    /// Wrap a snapshot, deriving the initial state from its power state
    pub(crate) fn new(base: ContainerBase) -> Self {
        let state = match base.power_state() {
            None => State::Created,
            Some(PowerState::PoweredOn) => State::Running,
            Some(PowerState::Suspended) => State::Suspended,
            Some(PowerState::PoweredOff) if base.exec_config().has_started() => State::Stopped,
            Some(PowerState::PoweredOff) => State::Created,
        };

        Self {
            id: base.id().to_string(),
            inner: Mutex::new(Inner {
                base,
                state,
                waiters: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> ContainerInfo {
        let inner = self.lock();
        ContainerInfo {
            base: inner.base.clone(),
            state: inner.state,
        }
    }

    pub fn current_state(&self) -> State {
        self.lock().state
    }

    /// Move to `state`, returning the previous state
    pub fn set_state(&self, state: State) -> State {
        let previous = self.lock().update_state(state);
        if previous != state {
            debug!("{}: {} -> {}", self.id, previous, state);
        }
        previous
    }

    /// Subscribe to the container reaching `state`
    ///
    /// The waiter has already fired when the container is in that state.
    pub fn wait_for_state(&self, state: State) -> StateWaiter {
        let mut inner = self.lock();
        if inner.state == state {
            return StateWaiter::fired();
        }

        let rx = match inner.waiters.get(&state) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(false);
                inner.waiters.insert(state, tx);
                rx
            }
        };
        StateWaiter { rx }
    }

    pub(crate) fn base(&self) -> ContainerBase {
        self.lock().base.clone()
    }

    pub(crate) fn replace_base(&self, base: ContainerBase) {
        self.lock().base = base;
    }

    /// Fold a committed handle back into the cache
    ///
    /// Skipped when the cached snapshot moved on since the handle was taken.
    pub(crate) fn refresh_from_handle(&self, handle: &Handle) -> bool {
        let mut inner = self.lock();
        let cached = inner.base.change_version().map(str::to_string);
        if cached.as_deref() != handle.origin_version() {
            warn!(
                "Skipping cache refresh of {}: change version {:?} differs from {:?}",
                self.id,
                cached,
                handle.origin_version()
            );
            return false;
        }

        inner.base = handle.base().clone();
        true
    }
}

/// All containers known to the engine, keyed by ID
#[derive(Default)]
pub struct ContainerCache {
    containers: RwLock<HashMap<String, Arc<Container>>>,
}

impl ContainerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Result<Option<Arc<Container>>> {
        let containers = self
            .containers
            .read()
            .map_err(|_| VesselError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(containers.get(id).cloned())
    }

    /// Insert a container, replacing any with the same ID
    pub fn put(&self, container: Arc<Container>) -> Result<Option<Arc<Container>>> {
        let mut containers = self
            .containers
            .write()
            .map_err(|_| VesselError::Lock("Failed to acquire write lock".to_string()))?;
        Ok(containers.insert(container.id().to_string(), container))
    }

    /// Insert a container unless one with the same ID is already cached
    pub fn put_if_absent(&self, container: Arc<Container>) -> Result<()> {
        let mut containers = self
            .containers
            .write()
            .map_err(|_| VesselError::Lock("Failed to acquire write lock".to_string()))?;

        if containers.contains_key(container.id()) {
            return Err(VesselError::ContainerExists(container.id().to_string()));
        }
        containers.insert(container.id().to_string(), container);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Option<Arc<Container>>> {
        let mut containers = self
            .containers
            .write()
            .map_err(|_| VesselError::Lock("Failed to acquire write lock".to_string()))?;
        Ok(containers.remove(id))
    }

    pub fn list(&self) -> Result<Vec<Arc<Container>>> {
        let containers = self
            .containers
            .read()
            .map_err(|_| VesselError::Lock("Failed to acquire read lock".to_string()))?;
        let mut list: Vec<Arc<Container>> = containers.values().cloned().collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.containers.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ExecConfig;
    use std::time::Duration;

    fn container(id: &str) -> Arc<Container> {
        Arc::new(Container::new(ContainerBase::new(ExecConfig::new(id, "web", "nginx"))))
    }

    #[test]
    fn test_new_container_is_created() {
        let c = container("abc");
        assert_eq!(c.current_state(), State::Created);
        assert_eq!(c.set_state(State::Starting), State::Created);
        assert_eq!(c.info().state(), State::Starting);
    }

    #[test]
    fn test_wait_for_current_state_is_already_signaled() {
        let c = container("abc");
        assert!(c.wait_for_state(State::Created).is_signaled());
        assert!(!c.wait_for_state(State::Running).is_signaled());
    }

    #[tokio::test]
    async fn test_waiters_fire_once() {
        let c = container("abc");
        let first = c.wait_for_state(State::Running);
        let second = c.wait_for_state(State::Running);
        let stopped = c.wait_for_state(State::Stopped);

        c.set_state(State::Running);
        assert!(first.is_signaled());
        assert!(tokio::time::timeout(Duration::from_secs(1), second.wait())
            .await
            .unwrap());
        assert!(!stopped.is_signaled());

        // a later subscription is new and not yet fired
        c.set_state(State::Stopped);
        let again = c.wait_for_state(State::Running);
        assert!(!again.is_signaled());
        assert!(stopped.is_signaled());
    }

    #[tokio::test]
    async fn test_waiter_wakes_across_tasks() {
        let c = container("abc");
        let waiter = c.wait_for_state(State::Running);
        let task = tokio::spawn(waiter.wait());

        c.set_state(State::Starting);
        c.set_state(State::Running);
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_released_when_container_dropped() {
        let c = container("abc");
        let waiter = c.wait_for_state(State::Running);
        drop(c);
        assert!(!waiter.wait().await);
    }

    #[test]
    fn test_cache_operations() {
        let cache = ContainerCache::new();
        cache.put_if_absent(container("a")).unwrap();
        cache.put_if_absent(container("b")).unwrap();
        assert!(matches!(
            cache.put_if_absent(container("a")),
            Err(VesselError::ContainerExists(_))
        ));

        assert_eq!(cache.len(), 2);
        let ids: Vec<String> = cache.list().unwrap().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(cache.remove("a").unwrap().is_some());
        assert!(cache.get("a").unwrap().is_none());
        assert!(cache.put(container("b")).unwrap().is_some());
    }
}
