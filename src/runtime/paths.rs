use std::path::{Component, Path, PathBuf};

use crate::errors::RuntimeError;

/// Maps project names to their source directories on the host.
#[derive(Debug, Clone)]
pub struct ProjectResolver {
    root: PathBuf,
}

impl ProjectResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Project names double as container-name suffixes, so they are held to
    /// Docker's naming rules: `[A-Za-z0-9][A-Za-z0-9_.-]*`.
    pub fn validate_name(project: &str) -> Result<(), RuntimeError> {
        let mut chars = project.chars();
        let valid = match chars.next() {
            Some(first) => {
                first.is_ascii_alphanumeric()
                    && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            }
            None => false,
        };
        if !valid {
            return Err(RuntimeError::InvalidInput(format!(
                "Invalid project name: {:?}",
                project
            )));
        }
        Ok(())
    }

    /// Absolute, canonical source directory of `project`.
    pub fn resolve(&self, project: &str) -> Result<PathBuf, RuntimeError> {
        Self::validate_name(project)?;

        let not_found = || RuntimeError::ProjectNotFound {
            project: project.to_string(),
        };
        let path = self.root.join(project).canonicalize().map_err(|_| not_found())?;
        if !path.is_dir() {
            return Err(not_found());
        }

        let root = self.root.canonicalize().map_err(|_| not_found())?;
        if !path.starts_with(&root) {
            return Err(RuntimeError::InvalidInput(format!(
                "Project {} resolves outside the projects root",
                project
            )));
        }
        Ok(path)
    }
}

/// Resolve a caller-supplied cwd against the container's workdir.
///
/// Only plain relative components are accepted; the result always stays
/// under `container_root`.
pub fn resolve_workdir(container_root: &str, cwd: Option<&str>) -> Result<String, RuntimeError> {
    let root = container_root.trim_end_matches('/');
    let Some(cwd) = cwd.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(container_root.to_string());
    };

    let mut parts = Vec::new();
    for component in Path::new(cwd).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(RuntimeError::InvalidInput(format!(
                    "Working directory escapes the project: {}",
                    cwd
                )));
            }
        }
    }

    if parts.is_empty() {
        return Ok(container_root.to_string());
    }
    Ok(format!("{}/{}", root, parts.join("/")))
}
