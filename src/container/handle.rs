//! Pending changes to a container

use super::base::ContainerBase;
use super::cache::ContainerInfo;
use super::config::ExecConfig;
use super::state::State;
use crate::error::Result;
use crate::infra::{PowerState, VmSpec};
use std::collections::HashMap;
use uuid::Uuid;

/// A private copy of a container plus the changes a commit should apply
///
/// A handle without a VM is a creation request and needs a full spec before
/// it can be committed.
#[derive(Debug, Clone)]
pub struct Handle {
    key: String,
    base: ContainerBase,
    spec: Option<VmSpec>,
    /// Cached state when the handle was taken
    state: State,
    /// State the commit should bring the container to; `Unknown` leaves power alone
    target_state: State,
    origin_version: Option<String>,
    exec_config_dirty: bool,
}

impl Handle {
    /// Handle creating a new container
    pub fn new(exec_config: ExecConfig) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            base: ContainerBase::new(exec_config),
            spec: None,
            state: State::Creating,
            target_state: State::Created,
            origin_version: None,
            exec_config_dirty: true,
        }
    }

    pub fn with_spec(mut self, spec: VmSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Handle mutating an existing container
    pub(crate) fn from_info(info: ContainerInfo) -> Self {
        let base = info.base().clone();
        Self {
            key: Uuid::new_v4().to_string(),
            origin_version: base.change_version().map(str::to_string),
            base,
            spec: None,
            state: info.state(),
            target_state: State::Unknown,
            exec_config_dirty: false,
        }
    }

    /// Unique key of this handle
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.base.id()
    }

    pub fn is_creation(&self) -> bool {
        self.base.vm().is_none()
    }

    pub fn base(&self) -> &ContainerBase {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut ContainerBase {
        &mut self.base
    }

    pub fn power_state(&self) -> Option<PowerState> {
        self.base.power_state()
    }

    /// State of the container when the handle was taken
    pub fn state(&self) -> State {
        self.state
    }

    pub fn target_state(&self) -> State {
        self.target_state
    }

    pub fn set_target_state(&mut self, state: State) {
        self.target_state = state;
    }

    pub fn spec(&self) -> Option<&VmSpec> {
        self.spec.as_ref()
    }

    /// Pending spec, created empty on first use
    pub fn spec_mut(&mut self) -> &mut VmSpec {
        self.spec.get_or_insert_with(VmSpec::default)
    }

    pub(crate) fn clear_spec(&mut self) {
        self.spec = None;
    }

    pub fn exec_config(&self) -> &ExecConfig {
        self.base.exec_config()
    }

    /// Exec config for editing; changes are persisted by the next commit
    pub fn exec_config_mut(&mut self) -> &mut ExecConfig {
        self.exec_config_dirty = true;
        self.base.exec_config_mut()
    }

    /// Change version of the snapshot the handle was taken from
    pub(crate) fn origin_version(&self) -> Option<&str> {
        self.origin_version.as_deref()
    }

    /// Copy a modified exec config into the pending spec's extra config
    pub(crate) fn stage_exec_config(&mut self) -> Result<()> {
        if !self.exec_config_dirty {
            return Ok(());
        }

        let encoded = self.base.exec_config().encode()?;
        self.spec_mut()
            .extra_config
            .get_or_insert_with(HashMap::new)
            .extend(encoded);
        self.exec_config_dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::EXEC_CONFIG_KEY;
    use crate::container::Container;

    #[test]
    fn test_creation_handle() {
        let handle = Handle::new(ExecConfig::new("abc", "web", "nginx"));
        assert!(handle.is_creation());
        assert!(handle.spec().is_none());
        assert_eq!(handle.state(), State::Creating);
        assert_eq!(handle.target_state(), State::Created);
        assert_eq!(handle.id(), "abc");
    }

    #[test]
    fn test_existing_handle_leaves_power_alone() {
        let container = Container::new(ContainerBase::new(ExecConfig::new("abc", "web", "nginx")));
        let handle = Handle::from_info(container.info());
        assert_eq!(handle.state(), State::Created);
        assert_eq!(handle.target_state(), State::Unknown);
    }

    #[test]
    fn test_stage_exec_config_only_when_modified() {
        let container = Container::new(ContainerBase::new(ExecConfig::new("abc", "web", "nginx")));
        let mut handle = Handle::from_info(container.info());

        handle.stage_exec_config().unwrap();
        assert!(handle.spec().is_none());

        handle.exec_config_mut().user = "root".to_string();
        handle.stage_exec_config().unwrap();
        let extra = handle.spec().unwrap().extra_config.as_ref().unwrap();
        assert!(extra[EXEC_CONFIG_KEY].contains("\"root\""));
    }

    #[test]
    fn test_handle_copy_is_private() {
        let container = Container::new(ContainerBase::new(ExecConfig::new("abc", "web", "nginx")));
        let mut handle = Handle::from_info(container.info());
        handle.exec_config_mut().name = "renamed".to_string();

        assert_eq!(container.info().base().exec_config().name, "web");
        assert_ne!(handle.key(), Handle::from_info(container.info()).key());
    }
}
