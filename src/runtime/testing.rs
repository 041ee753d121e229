//! In-process container runtime for tests.
//!
//! Containers are entries in a table. `exec_argv` runs the command on the
//! host instead of in a container, so executor, supervisor and terminal
//! tests drive real processes. In relay mode a parent shell sits between
//! the caller and the command and does not forward signals, like the
//! `docker exec` client.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::docker::{ContainerRuntime, ContainerSpec, ExecSpec};
use crate::errors::RuntimeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
}

#[derive(Default)]
struct State {
    /// container name -> running
    containers: BTreeMap<String, bool>,
    calls: Vec<Call>,
    fail_create: bool,
    fail_inspect: Vec<String>,
    relay: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, matcher: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| matcher(c)).count()
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn fail_inspect(&self, container: &str) {
        self.state.lock().unwrap().fail_inspect.push(container.to_string());
    }

    pub fn set_relay(&self, relay: bool) {
        self.state.lock().unwrap().relay = relay;
    }

    /// Simulate a container disappearing behind our back.
    pub fn forget(&self, container: &str) {
        self.state.lock().unwrap().containers.remove(container);
    }

    pub fn set_running(&self, container: &str, running: bool) {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(container.to_string(), running);
    }

    fn check_inspect(state: &State, name: &str) -> Result<(), RuntimeError> {
        if state.fail_inspect.iter().any(|c| c == name) {
            return Err(RuntimeError::external("inspect", name, "daemon unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let state = self.state.lock().unwrap();
        Self::check_inspect(&state, name)?;
        Ok(state.containers.contains_key(name))
    }

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError> {
        let state = self.state.lock().unwrap();
        Self::check_inspect(&state, name)?;
        Ok(state.containers.get(name).copied().unwrap_or(false))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create(spec.name.clone()));
        if state.fail_create {
            return Err(RuntimeError::external("create", &spec.name, "image not found"));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::external("create", &spec.name, "name already in use"));
        }
        state.containers.insert(spec.name.clone(), false);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Start(name.to_string()));
        match state.containers.get_mut(name) {
            Some(running) => {
                *running = true;
                Ok(())
            }
            None => Err(RuntimeError::external("start", name, "No such container")),
        }
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Stop(name.to_string()));
        match state.containers.get_mut(name) {
            Some(running) => {
                *running = false;
                Ok(())
            }
            None => Err(RuntimeError::external("stop", name, "No such container")),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Remove(name.to_string()));
        match state.containers.remove(name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::external("remove", name, "No such container")),
        }
    }

    fn exec_argv(&self, _container: &str, exec: &ExecSpec) -> Vec<String> {
        let mut argv = Vec::new();
        if self.state.lock().unwrap().relay {
            // The trailing `exit` keeps sh from exec-ing the command.
            argv.extend(["sh", "-c", "\"$@\"; exit $?", "sh"].map(str::to_string));
        }
        argv.push(exec.command.clone());
        argv.extend(exec.args.iter().cloned());
        argv
    }
}
