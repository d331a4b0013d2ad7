// Environment Module
// Per-cell isolated environments backed by the dependency cache

pub mod builder;
pub mod installer;

pub use builder::{EnvironmentBuilder, EnvironmentHandle, ENV_DIR_VAR, MATRIX_VERSION_VAR};
pub use installer::{DependencyInstaller, InstallRequest, NoopInstaller, ShellInstaller};
