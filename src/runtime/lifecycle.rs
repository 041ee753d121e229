use std::sync::Arc;

use runway_common::{RuntimeRecord, RuntimeStatus};
use tracing::{info, warn};

use super::docker::{ContainerRuntime, ContainerSpec};
use super::paths::ProjectResolver;
use super::store::RuntimeStore;
use crate::config::ContainerSection;
use crate::errors::RuntimeError;

/// Creates, starts, stops and removes project containers, keeping the
/// store in step with what the container runtime reports.
///
/// Operations on the same project are not serialized here. Start and stop
/// are idempotent and every store write is a single-record update, so
/// duplicate concurrent calls are redundant rather than harmful.
pub struct LifecycleManager {
    store: RuntimeStore,
    runtime: Arc<dyn ContainerRuntime>,
    resolver: ProjectResolver,
    container: ContainerSection,
}

impl LifecycleManager {
    pub fn new(
        store: RuntimeStore,
        runtime: Arc<dyn ContainerRuntime>,
        resolver: ProjectResolver,
        container: ContainerSection,
    ) -> Self {
        Self {
            store,
            runtime,
            resolver,
            container,
        }
    }

    pub fn store(&self) -> &RuntimeStore {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn container_config(&self) -> &ContainerSection {
        &self.container
    }

    /// Container names are derived, never looked up.
    pub fn container_name_for(&self, project: &str) -> String {
        format!("{}{}", self.container.name_prefix, project)
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        self.runtime.container_exists(name).await
    }

    pub async fn is_running(&self, name: &str) -> Result<bool, RuntimeError> {
        self.runtime.is_running(name).await
    }

    /// Write the record, then create (but do not start) the container.
    ///
    /// Fails with `AlreadyExists` if the project already has a record. If
    /// the container cannot be created the record is removed again.
    pub async fn create(
        &self,
        project: &str,
        image: Option<&str>,
    ) -> Result<RuntimeRecord, RuntimeError> {
        let resolver = self.resolver.clone();
        let name = project.to_string();
        let source = tokio::task::spawn_blocking(move || resolver.resolve(&name))
            .await
            .map_err(|e| RuntimeError::external("resolve", project, e))??;

        let memory_bytes = self
            .container
            .memory_bytes()
            .map_err(|e| RuntimeError::InvalidInput(format!("{:#}", e)))?;
        let container_name = self.container_name_for(project);
        let image = image.unwrap_or(&self.container.image).to_string();

        let record = self
            .store
            .create(
                project,
                &source.to_string_lossy(),
                &image,
                &container_name,
            )
            .await?;

        let spec = ContainerSpec {
            name: container_name.clone(),
            project: project.to_string(),
            image,
            source,
            workdir: self.container.workdir.clone(),
            memory_bytes,
            nano_cpus: self.container.nano_cpus(),
            keepalive: self.container.keepalive.clone(),
        };
        if let Err(e) = self.runtime.create_container(&spec).await {
            if let Err(rollback) = self.store.delete(project).await {
                warn!(project = %project, error = %rollback, "Failed to roll back runtime record");
            }
            return Err(e);
        }

        info!(project = %project, container = %container_name, "Created runtime container");
        Ok(record)
    }

    /// Start the project's container. A running container is left alone.
    pub async fn start(&self, project: &str) -> Result<RuntimeRecord, RuntimeError> {
        let record = self.store.get(project).await?;
        let container = &record.container_name;

        if self.runtime.is_running(container).await? {
            if !record.is_running() {
                self.store.update_status(project, RuntimeStatus::Running).await?;
                return self.store.get(project).await;
            }
            return Ok(record);
        }

        self.runtime.start_container(container).await?;
        self.store.update_status(project, RuntimeStatus::Running).await?;
        info!(project = %project, container = %container, "Started runtime container");
        self.store.get(project).await
    }

    /// Stop the project's container. A stopped container is left alone.
    pub async fn stop(&self, project: &str) -> Result<RuntimeRecord, RuntimeError> {
        let record = self.store.get(project).await?;
        let container = &record.container_name;

        if self.runtime.is_running(container).await? {
            self.runtime.stop_container(container).await?;
            info!(project = %project, container = %container, "Stopped runtime container");
        } else if !record.is_running() {
            return Ok(record);
        }

        self.store.update_status(project, RuntimeStatus::Stopped).await?;
        self.store.get(project).await
    }

    /// Stop if running, remove the container, then delete the record.
    pub async fn remove(&self, project: &str) -> Result<(), RuntimeError> {
        let record = self.store.get(project).await?;
        let container = &record.container_name;

        if self.runtime.is_running(container).await? {
            self.runtime.stop_container(container).await?;
        }
        if self.runtime.container_exists(container).await? {
            self.runtime.remove_container(container).await?;
        }
        self.store.delete(project).await?;

        info!(project = %project, container = %container, "Removed runtime container");
        Ok(())
    }

    pub async fn status(&self, project: &str) -> Result<RuntimeRecord, RuntimeError> {
        self.store.get(project).await
    }

    pub async fn list(&self) -> Result<Vec<RuntimeRecord>, RuntimeError> {
        self.store.list_all().await
    }

    /// Create the container on first use, then start it.
    pub async fn ensure_started(&self, project: &str) -> Result<RuntimeRecord, RuntimeError> {
        match self.store.get(project).await {
            Ok(_) => {}
            Err(RuntimeError::RuntimeNotFound { .. }) => match self.create(project, None).await {
                // Lost a creation race; the winner's record is fine to start.
                Ok(_) | Err(RuntimeError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        }
        self.start(project).await
    }
}
