// Dependency Installer
// Populates a cell's environment directory when the cache has no entry for it

use crate::error::{EngineError, EngineResult};
use crate::runners::{Script, ShellRunner};
use crate::workflow::template::{render, TemplateScope};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Everything an installer needs to build one environment
#[derive(Debug, Clone, Copy)]
pub struct InstallRequest<'a> {
    pub version: &'a str,
    /// Directory to populate; exists and is empty
    pub env_dir: &'a Path,
    /// Directory the installer runs in
    pub workspace: &'a Path,
    /// Variables of the environment being built
    pub env: &'a HashMap<String, String>,
}

/// Builds the dependency tree of an environment
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self, request: InstallRequest<'_>) -> EngineResult<()>;
}

/// Runs the pipeline's `install` command template through the shell
pub struct ShellInstaller {
    runner: ShellRunner,
    template: String,
    pipeline_env: Arc<BTreeMap<String, String>>,
}

impl ShellInstaller {
    pub fn new(
        runner: ShellRunner,
        template: impl Into<String>,
        pipeline_env: Arc<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            runner,
            template: template.into(),
            pipeline_env,
        }
    }
}

#[async_trait]
impl DependencyInstaller for ShellInstaller {
    async fn install(&self, request: InstallRequest<'_>) -> EngineResult<()> {
        let scope = TemplateScope {
            env: &self.pipeline_env,
            version: Some(request.version),
        };
        let command = render(&self.template, &scope)?;

        let mut env: HashMap<String, String> = self
            .pipeline_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(request.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        debug!(version = request.version, command = %command, "installing dependencies");
        let output = self
            .runner
            .run(Script::new(&command, request.workspace).env(&env))
            .await;

        if output.success() {
            return Ok(());
        }

        Err(EngineError::DependencyInstallFailed {
            version: request.version.to_string(),
            exit_code: output.exit_code,
            output: output.combined(),
        })
    }
}

/// Installer for pipelines without an install step
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstaller;

#[async_trait]
impl DependencyInstaller for NoopInstaller {
    async fn install(&self, _request: InstallRequest<'_>) -> EngineResult<()> {
        Ok(())
    }
}
