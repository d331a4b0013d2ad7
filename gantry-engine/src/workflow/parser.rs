use crate::error::{EngineError, EngineResult};
use crate::workflow::models::{PipelineSpec, StepSpec};
use crate::workflow::template::{self, TemplateRef};

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Parser for pipeline YAML files.
pub struct PipelineParser;

impl PipelineParser {
    /// Parse a pipeline from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<PipelineSpec> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a pipeline from a YAML string.
    pub fn parse(content: &str) -> EngineResult<PipelineSpec> {
        let spec: PipelineSpec = serde_yaml::from_str(content)?;
        Ok(spec)
    }

    /// Parse and validate a pipeline from a YAML string.
    pub fn parse_and_validate(content: &str) -> EngineResult<PipelineSpec> {
        let spec = Self::parse(content)?;
        Self::validate(&spec)?;
        Ok(spec)
    }

    /// Parse and validate a pipeline file.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<PipelineSpec> {
        let spec = Self::from_file(path)?;
        Self::validate(&spec)?;
        Ok(spec)
    }

    /// Validate a parsed pipeline for semantic correctness.
    pub fn validate(spec: &PipelineSpec) -> EngineResult<()> {
        if spec.matrix.versions.is_empty() {
            return Err(EngineError::InvalidInput(
                "Matrix must list at least one version".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for version in &spec.matrix.versions {
            if version.trim().is_empty() {
                return Err(EngineError::InvalidInput(
                    "Matrix contains an empty version".to_string(),
                ));
            }
            if !seen.insert(version.as_str()) {
                return Err(EngineError::InvalidInput(format!(
                    "Matrix version '{}' is listed more than once",
                    version
                )));
            }
        }

        if spec.matrix.max_parallel == Some(0) {
            return Err(EngineError::InvalidInput(
                "max_parallel must be at least 1".to_string(),
            ));
        }

        if let Some(report_version) = spec.report_version() {
            if !seen.contains(report_version) {
                return Err(EngineError::InvalidInput(format!(
                    "Report version '{}' is not part of the matrix",
                    report_version
                )));
            }
        }

        let mut service_names = HashSet::new();
        for service in &spec.services {
            if service.name.trim().is_empty() || service.image.trim().is_empty() {
                return Err(EngineError::InvalidInput(
                    "Every service needs a name and an image".to_string(),
                ));
            }
            if !service_names.insert(service.name.as_str()) {
                return Err(EngineError::InvalidInput(format!(
                    "Service '{}' is declared more than once",
                    service.name
                )));
            }
            let mappings = service.port_mappings()?;
            for fixed in mappings.iter().filter_map(|m| m.host) {
                warn!(
                    service = %service.name,
                    host_port = fixed,
                    "fixed host port ignored; every cell publishes on its own port"
                );
            }
            if let Some(port) = service.readiness_port {
                if !mappings.iter().any(|m| m.container == port) {
                    return Err(EngineError::InvalidInput(format!(
                        "Service '{}' readiness_port {} is not one of its ports",
                        service.name, port
                    )));
                }
            }
        }

        if spec.steps.is_empty() {
            return Err(EngineError::InvalidInput(
                "Pipeline has no test steps".to_string(),
            ));
        }

        Self::validate_steps(spec, "test", &spec.steps, true)?;

        if let Some(analysis) = &spec.analysis {
            if analysis.steps.is_empty() {
                return Err(EngineError::InvalidInput(format!(
                    "Analysis job '{}' has no steps",
                    analysis.name
                )));
            }
            Self::validate_steps(spec, &analysis.name, &analysis.steps, false)?;
        }

        if let Some(install) = &spec.install {
            Self::validate_template(spec, "install", install, true)?;
        }

        Ok(())
    }

    fn validate_steps(
        spec: &PipelineSpec,
        job: &str,
        steps: &[StepSpec],
        in_matrix: bool,
    ) -> EngineResult<()> {
        for (index, step) in steps.iter().enumerate() {
            if step.run.trim().is_empty() {
                return Err(EngineError::InvalidInput(format!(
                    "Step {} '{}' in job '{}' has an empty command",
                    index, step.name, job
                )));
            }
            Self::validate_template(spec, &step.name, &step.run, in_matrix)?;
        }
        Ok(())
    }

    fn validate_template(
        spec: &PipelineSpec,
        owner: &str,
        text: &str,
        in_matrix: bool,
    ) -> EngineResult<()> {
        for reference in template::references(text)? {
            match reference {
                TemplateRef::Env(name) if !spec.env.contains_key(&name) => {
                    return Err(EngineError::InvalidInput(format!(
                        "'{}' references undefined env variable '{}'",
                        owner, name
                    )));
                }
                TemplateRef::MatrixVersion if !in_matrix => {
                    return Err(EngineError::InvalidInput(format!(
                        "'{}' uses matrix.version outside the matrix job",
                        owner
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CI: &str = r#"
name: build
on:
  - event: push
    branch: main
  - event: tag
    prefix: v
  - event: pull_request
    target: main
  - event: manual
env:
  LATEST_PY_VERSION: "3.10"
  COVERAGE_ARGS: "--cov --cov-report=term --cov-report=xml"
matrix:
  versions: ["3.7", "3.8", "3.9", "3.10"]
services:
  - name: redis
    image: redis
    ports: ["6379:6379"]
lockfile: poetry.lock
install: poetry install -v -E all
steps:
  - name: unit tests
    run: pytest tests/unit ${{ env.COVERAGE_ARGS }}
    coverage: coverage.json
  - name: integration tests
    run: pytest tests/integration ${{ env.COVERAGE_ARGS }} --cov-append
    coverage: coverage.json
    append: true
analysis:
  steps:
    - name: style
      run: pre-commit run -a
"#;

    #[test]
    fn test_parse_and_validate_success() {
        let spec = PipelineParser::parse_and_validate(CI).unwrap();
        assert_eq!(spec.name, "build");
        assert_eq!(spec.matrix.versions.len(), 4);
        assert_eq!(spec.triggers.len(), 4);
        assert_eq!(spec.report_version(), Some("3.10"));
        assert!(spec.steps[1].append);
        assert_eq!(spec.analysis.as_ref().unwrap().name, "analysis");
    }

    #[test]
    fn test_validate_empty_matrix() {
        let yaml = r#"
name: ci
matrix:
  versions: []
steps:
  - name: t
    run: pytest
"#;
        let spec = PipelineParser::parse(yaml).unwrap();
        let err = PipelineParser::validate(&spec).unwrap_err();
        assert!(err.to_string().contains("at least one version"));
    }

    #[test]
    fn test_validate_duplicate_version() {
        let yaml = r#"
name: ci
matrix:
  versions: ["3.9", "3.9"]
steps:
  - name: t
    run: pytest
"#;
        let spec = PipelineParser::parse(yaml).unwrap();
        let err = PipelineParser::validate(&spec).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_report_version_outside_matrix() {
        let yaml = r#"
name: ci
env:
  LATEST_PY_VERSION: "3.11"
matrix:
  versions: ["3.9", "3.10"]
steps:
  - name: t
    run: pytest
"#;
        let spec = PipelineParser::parse(yaml).unwrap();
        let err = PipelineParser::validate(&spec).unwrap_err();
        assert!(err.to_string().contains("not part of the matrix"));
    }

    #[test]
    fn test_validate_undefined_env_reference() {
        let yaml = r#"
name: ci
matrix:
  versions: ["3.9"]
steps:
  - name: t
    run: pytest ${{ env.NOPE }}
"#;
        let spec = PipelineParser::parse(yaml).unwrap();
        let err = PipelineParser::validate(&spec).unwrap_err();
        assert!(err.to_string().contains("undefined env variable 'NOPE'"));
    }

    #[test]
    fn test_validate_matrix_version_in_analysis() {
        let yaml = r#"
name: ci
matrix:
  versions: ["3.9"]
steps:
  - name: t
    run: pytest
analysis:
  name: lint
  steps:
    - name: style
      run: flake8 --target ${{ matrix.version }}
"#;
        let spec = PipelineParser::parse(yaml).unwrap();
        let err = PipelineParser::validate(&spec).unwrap_err();
        assert!(err.to_string().contains("outside the matrix job"));
    }

    #[test]
    fn test_validate_bad_service() {
        let yaml = r#"
name: ci
matrix:
  versions: ["3.9"]
services:
  - name: redis
    image: redis
    ports: ["not-a-port"]
steps:
  - name: t
    run: pytest
"#;
        let spec = PipelineParser::parse(yaml).unwrap();
        assert!(PipelineParser::validate(&spec).is_err());

        let yaml = r#"
name: ci
matrix:
  versions: ["3.9"]
services:
  - name: redis
    image: redis
  - name: redis
    image: redis:7
steps:
  - name: t
    run: pytest
"#;
        let spec = PipelineParser::parse(yaml).unwrap();
        let err = PipelineParser::validate(&spec).unwrap_err();
        assert!(err.to_string().contains("declared more than once"));

        let yaml = r#"
name: ci
matrix:
  versions: ["3.9"]
services:
  - name: dynamodb
    image: amazon/dynamodb-local
    ports: ["8000"]
    readiness_port: 8001
steps:
  - name: t
    run: pytest
"#;
        let spec = PipelineParser::parse(yaml).unwrap();
        let err = PipelineParser::validate(&spec).unwrap_err();
        assert!(err.to_string().contains("readiness_port 8001"));
    }

    #[test]
    fn test_validate_no_steps() {
        let yaml = r#"
name: ci
matrix:
  versions: ["3.9"]
steps: []
"#;
        let spec = PipelineParser::parse(yaml).unwrap();
        let err = PipelineParser::validate(&spec).unwrap_err();
        assert!(err.to_string().contains("no test steps"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.yml");
        fs::write(&path, CI).unwrap();

        let spec = PipelineParser::load(&path).unwrap();
        assert_eq!(spec.services[0].name, "redis");
        assert!(PipelineParser::from_file(dir.path().join("missing.yml")).is_err());
    }
}
