use crate::error::{EngineError, EngineResult};
use crate::workflow::trigger::{TriggerEvent, TriggerRule};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A matrix CI pipeline definition.
///
/// Immutable once loaded; the engine shares it behind an `Arc` so every
/// cell sees the same environment mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// The name of the pipeline
    pub name: String,

    /// Trigger rules, evaluated in order with short-circuit OR
    #[serde(default, rename = "on")]
    pub triggers: Vec<TriggerRule>,

    /// Process-wide environment variables visible to every step
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// The version matrix
    pub matrix: MatrixSpec,

    /// Version whose cell forwards coverage (overrides `report_version_env`)
    #[serde(default)]
    pub report_version: Option<String>,

    /// Name of the env entry holding the report version
    #[serde(default = "default_report_version_env")]
    pub report_version_env: String,

    /// Ephemeral services started once per cell
    #[serde(default)]
    pub services: Vec<ServiceSpec>,

    /// Dependency lockfile, relative to the workspace
    #[serde(default)]
    pub lockfile: Option<PathBuf>,

    /// Dependency installation command template, run on cache miss
    #[serde(default)]
    pub install: Option<String>,

    /// Test steps executed in every cell
    pub steps: Vec<StepSpec>,

    /// Independent static-analysis job
    #[serde(default)]
    pub analysis: Option<AnalysisSpec>,

    /// Where the designated cell sends its coverage report
    #[serde(default)]
    pub report: Option<ReportSinkSpec>,
}

fn default_report_version_env() -> String {
    "LATEST_PY_VERSION".to_string()
}

impl PipelineSpec {
    /// Version whose cell forwards the merged coverage report
    pub fn report_version(&self) -> Option<&str> {
        self.report_version
            .as_deref()
            .or_else(|| self.env.get(&self.report_version_env).map(String::as_str))
    }

    /// Whether any trigger rule matches the event
    pub fn should_run(&self, event: &TriggerEvent) -> bool {
        self.triggers.iter().any(|rule| rule.matches(event))
    }
}

/// Matrix configuration for the test job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSpec {
    /// One cell per version identifier, in order
    pub versions: Vec<String>,

    /// Stop launching work once any cell fails
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,

    /// What fail-fast stops
    #[serde(default)]
    pub fail_fast_scope: FailFastScope,

    /// Maximum number of cells running at once
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

fn default_fail_fast() -> bool {
    true
}

/// Reach of the matrix-level fail-fast flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailFastScope {
    /// Cells that have not started are never launched
    #[default]
    Cells,
    /// Also stop running cells from launching further steps
    Steps,
}

/// An ephemeral service (database container, cache server, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name
    pub name: String,

    /// Container image reference
    pub image: String,

    /// Container ports to publish: "container" or "host:container". Each
    /// cell publishes them on its own runtime-assigned loopback ports, so a
    /// host part is accepted but not used.
    #[serde(default)]
    pub ports: Vec<String>,

    /// Environment variables for the service container
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Container port whose published host port gates readiness (default:
    /// every published port). Must be one of `ports`.
    #[serde(default)]
    pub readiness_port: Option<u16>,

    /// Extra container runtime options (space-separated flags)
    #[serde(default)]
    pub options: Option<String>,
}

/// A parsed port binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host port as written; publishing always lets the runtime pick one
    pub host: Option<u16>,
    /// Port inside the container
    pub container: u16,
}

impl PortMapping {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        let parse_port = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|_| EngineError::InvalidInput(format!("Invalid port mapping '{}'", raw)))
        };

        match raw.rsplit_once(':') {
            Some((host, container)) if host.trim().is_empty() => Ok(Self {
                host: None,
                container: parse_port(container)?,
            }),
            Some((host, container)) => Ok(Self {
                host: Some(parse_port(host)?),
                container: parse_port(container)?,
            }),
            None => Ok(Self {
                host: None,
                container: parse_port(raw)?,
            }),
        }
    }
}

impl ServiceSpec {
    pub fn port_mappings(&self) -> EngineResult<Vec<PortMapping>> {
        self.ports.iter().map(|p| PortMapping::parse(p)).collect()
    }

    /// Container side of every port binding, in declaration order
    pub fn container_ports(&self) -> EngineResult<Vec<u16>> {
        Ok(self
            .port_mappings()?
            .into_iter()
            .map(|m| m.container)
            .collect())
    }
}

/// A step executed in a cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Display name
    pub name: String,

    /// Shell command template
    pub run: String,

    /// Run condition; absent means always
    #[serde(default, rename = "if")]
    pub condition: Option<RunCondition>,

    /// Coverage fragment produced by the step, relative to the cell's
    /// private directory (`GANTRY_CELL_DIR`)
    #[serde(default)]
    pub coverage: Option<PathBuf>,

    /// Accumulate this fragment onto earlier ones instead of replacing them
    #[serde(default)]
    pub append: bool,

    /// Step-level environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Typed run condition for a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum RunCondition {
    Always,
    /// Only on the designated report version
    ReportVersion,
    Version {
        version: String,
    },
    Versions {
        versions: Vec<String>,
    },
    EnvEquals {
        name: String,
        value: String,
    },
    Not {
        condition: Box<RunCondition>,
    },
}

/// Values a run condition is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    pub version: Option<&'a str>,
    pub report_version: Option<&'a str>,
    pub env: &'a BTreeMap<String, String>,
}

impl RunCondition {
    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> bool {
        match self {
            RunCondition::Always => true,
            RunCondition::ReportVersion => match (ctx.version, ctx.report_version) {
                (Some(version), Some(report)) => version == report,
                _ => false,
            },
            RunCondition::Version { version } => ctx.version == Some(version.as_str()),
            RunCondition::Versions { versions } => ctx
                .version
                .map(|v| versions.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
            RunCondition::EnvEquals { name, value } => ctx.env.get(name) == Some(value),
            RunCondition::Not { condition } => !condition.evaluate(ctx),
        }
    }
}

/// The static-analysis job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSpec {
    #[serde(default = "default_analysis_name")]
    pub name: String,

    pub steps: Vec<StepSpec>,
}

fn default_analysis_name() -> String {
    "analysis".to_string()
}

/// Reporting sink for the merged coverage report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "sink", rename_all = "snake_case")]
pub enum ReportSinkSpec {
    /// Write the report as JSON to a file
    File { path: PathBuf },
    /// Pipe the report as JSON to an uploader command's stdin
    Command { run: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_port_mappings() {
        assert_eq!(
            PortMapping::parse("6379:6379").unwrap(),
            PortMapping {
                host: Some(6379),
                container: 6379
            }
        );
        assert_eq!(
            PortMapping::parse("27017").unwrap(),
            PortMapping {
                host: None,
                container: 27017
            }
        );
        assert_eq!(
            PortMapping::parse(":8000").unwrap(),
            PortMapping {
                host: None,
                container: 8000
            }
        );
        assert!(PortMapping::parse("redis:6379").is_err());
        assert!(PortMapping::parse("70000").is_err());
    }

    #[test]
    fn test_report_version_from_env() {
        let yaml = r#"
name: CI
env:
  LATEST_PY_VERSION: "3.10"
matrix:
  versions: ["3.9", "3.10"]
steps:
  - name: test
    run: pytest
"#;
        let spec: PipelineSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.report_version(), Some("3.10"));
        assert!(spec.matrix.fail_fast);
        assert_eq!(spec.matrix.fail_fast_scope, FailFastScope::Cells);

        let explicit = PipelineSpec {
            report_version: Some("3.9".to_string()),
            ..spec
        };
        assert_eq!(explicit.report_version(), Some("3.9"));
    }

    #[test]
    fn test_parse_run_conditions() {
        let yaml = r#"
- name: always
  run: echo a
- name: latest only
  run: echo b
  if: { when: report_version }
- name: pinned
  run: echo c
  if: { when: version, version: "3.8" }
- name: not latest
  run: echo d
  if:
    when: not
    condition: { when: report_version }
"#;
        let steps: Vec<StepSpec> = serde_yaml::from_str(yaml).unwrap();
        assert!(steps[0].condition.is_none());
        assert_eq!(steps[1].condition, Some(RunCondition::ReportVersion));
        assert_eq!(
            steps[2].condition,
            Some(RunCondition::Version {
                version: "3.8".to_string()
            })
        );
        assert!(matches!(steps[3].condition, Some(RunCondition::Not { .. })));
    }

    #[test]
    fn test_evaluate_conditions() {
        let vars = env(&[("MODE", "full")]);
        let ctx = ConditionContext {
            version: Some("3.10"),
            report_version: Some("3.10"),
            env: &vars,
        };
        let other = ConditionContext {
            version: Some("3.7"),
            ..ctx
        };

        assert!(RunCondition::Always.evaluate(&other));
        assert!(RunCondition::ReportVersion.evaluate(&ctx));
        assert!(!RunCondition::ReportVersion.evaluate(&other));
        assert!(RunCondition::Versions {
            versions: vec!["3.7".to_string(), "3.8".to_string()]
        }
        .evaluate(&other));
        assert!(RunCondition::EnvEquals {
            name: "MODE".to_string(),
            value: "full".to_string()
        }
        .evaluate(&ctx));
        assert!(RunCondition::Not {
            condition: Box::new(RunCondition::ReportVersion)
        }
        .evaluate(&other));
    }

    #[test]
    fn test_report_version_without_cell_version() {
        let vars = BTreeMap::new();
        let ctx = ConditionContext {
            version: None,
            report_version: Some("3.10"),
            env: &vars,
        };
        assert!(!RunCondition::ReportVersion.evaluate(&ctx));
    }

    #[test]
    fn test_parse_services_and_sink() {
        let yaml = r#"
name: CI
matrix:
  versions: ["3.10"]
  fail_fast: false
  fail_fast_scope: steps
  max_parallel: 2
services:
  - name: redis
    image: redis:7
    ports: ["6379:6379"]
  - name: mongo
    image: mongo:6
    ports: ["27017"]
    readiness_port: 27017
report:
  sink: command
  run: coveralls --service=github
steps:
  - name: test
    run: pytest
"#;
        let spec: PipelineSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(!spec.matrix.fail_fast);
        assert_eq!(spec.matrix.fail_fast_scope, FailFastScope::Steps);
        assert_eq!(spec.matrix.max_parallel, Some(2));
        assert_eq!(spec.services.len(), 2);
        assert_eq!(spec.services[1].readiness_port, Some(27017));
        assert_eq!(
            spec.report,
            Some(ReportSinkSpec::Command {
                run: "coveralls --service=github".to_string()
            })
        );
    }
}
