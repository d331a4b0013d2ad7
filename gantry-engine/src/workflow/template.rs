// Command Templates
// Substitutes ${{ env.NAME }} and ${{ matrix.version }} references in step commands

use crate::error::{EngineError, EngineResult};

use std::collections::BTreeMap;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// A reference found inside a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    Env(String),
    MatrixVersion,
}

/// Values available to a template
#[derive(Debug, Clone, Copy)]
pub struct TemplateScope<'a> {
    pub env: &'a BTreeMap<String, String>,
    pub version: Option<&'a str>,
}

/// Extract every reference from a template
pub fn references(template: &str) -> EngineResult<Vec<TemplateRef>> {
    let mut refs = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let end = after.find(CLOSE).ok_or_else(|| {
            EngineError::Template(format!("Unterminated '{}' in '{}'", OPEN, template))
        })?;
        refs.push(parse_reference(after[..end].trim())?);
        rest = &after[end + CLOSE.len()..];
    }

    Ok(refs)
}

fn parse_reference(expr: &str) -> EngineResult<TemplateRef> {
    if expr == "matrix.version" {
        return Ok(TemplateRef::MatrixVersion);
    }
    if let Some(name) = expr.strip_prefix("env.") {
        if !name.is_empty() {
            return Ok(TemplateRef::Env(name.to_string()));
        }
    }
    Err(EngineError::Template(format!(
        "Unsupported reference '{}' (expected env.NAME or matrix.version)",
        expr
    )))
}

/// Render a template against a scope
pub fn render(template: &str, scope: &TemplateScope<'_>) -> EngineResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after.find(CLOSE).ok_or_else(|| {
            EngineError::Template(format!("Unterminated '{}' in '{}'", OPEN, template))
        })?;

        match parse_reference(after[..end].trim())? {
            TemplateRef::Env(name) => {
                let value = scope.env.get(&name).ok_or_else(|| {
                    EngineError::Template(format!("Unknown environment variable '{}'", name))
                })?;
                out.push_str(value);
            }
            TemplateRef::MatrixVersion => {
                let version = scope.version.ok_or_else(|| {
                    EngineError::Template("matrix.version used outside a matrix cell".to_string())
                })?;
                out.push_str(version);
            }
        }

        rest = &after[end + CLOSE.len()..];
    }

    out.push_str(rest);
    Ok(out)
}
