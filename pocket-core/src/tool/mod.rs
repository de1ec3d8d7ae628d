//! Tool model: manifests, requests, and invocation-ready definitions
//!
//! A tool package is a directory holding a `pocket.toml` manifest, an
//! optional `schema.json` argument schema, and the code the runtime
//! executes. Packages arrive through the lockfile; this module turns a
//! synced package into a registered [`Tool`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::auth::AuthProvider;
use crate::error::{PocketError, Result};
use crate::repository::Lock;
use crate::runtime::RuntimeSpec;

/// Authentication a tool declares it needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolAuth {
    /// Provider whose default handler is used when `handler_name` is unset
    #[serde(default)]
    pub provider: Option<AuthProvider>,

    /// Explicit handler name; wins over `provider`
    #[serde(default)]
    pub handler_name: Option<String>,

    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Contents of a package's `pocket.toml`
#[derive(Debug, Clone, Deserialize)]
pub struct ToolManifest {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// How the tool is executed
    pub runtime: RuntimeSpec,

    #[serde(default)]
    pub auth: Option<ToolAuth>,

    /// Variables the tool needs, mapped to their defaults; an empty default
    /// means the value must come from elsewhere
    #[serde(default)]
    pub tool_vars: HashMap<String, String>,
}

/// One tool package source plus per-request overrides
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub lock: Lock,

    /// Path of the tool inside the package, empty for the package root
    pub subpath: String,

    /// Highest-priority variable values for this tool
    pub overrides: HashMap<String, String>,

    /// Optional postprocessors applied to the tool's output in order
    pub postprocessors: Vec<Postprocessor>,
}

impl ToolRequest {
    pub fn new(lock: Lock) -> Self {
        Self {
            lock,
            subpath: String::new(),
            overrides: HashMap::new(),
            postprocessors: Vec::new(),
        }
    }

    pub fn with_subpath(mut self, subpath: impl Into<String>) -> Self {
        self.subpath = subpath.into();
        self
    }

    pub fn with_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_postprocessor(mut self, postprocessor: Postprocessor) -> Self {
        self.postprocessors.push(postprocessor);
        self
    }

    /// Directory of the tool inside the synced package
    pub fn tool_dir(&self, toolpkg_base: &Path) -> PathBuf {
        let pkg = self.lock.toolpkg_path(toolpkg_base);
        if self.subpath.is_empty() {
            pkg
        } else {
            pkg.join(&self.subpath)
        }
    }
}

/// Named transformation applied to tool output
#[derive(Clone)]
pub struct Postprocessor {
    pub name: String,
    func: Arc<dyn Fn(String) -> Result<String> + Send + Sync>,
}

impl Postprocessor {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(String) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn apply(&self, output: String) -> Result<String> {
        (self.func)(output)
    }
}

impl std::fmt::Debug for Postprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Postprocessor")
            .field("name", &self.name)
            .finish()
    }
}

/// A registered, invocation-ready tool
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,

    /// JSON schema of the tool's arguments, for the model's tool listing
    pub schema: serde_json::Value,

    pub auth: Option<ToolAuth>,
    pub runtime: RuntimeSpec,

    /// Directory the tool executes in
    pub tool_dir: PathBuf,

    /// Resolved variables injected into the tool's environment
    pub vars: HashMap<String, String>,

    pub postprocessors: Vec<Postprocessor>,
}

impl Tool {
    /// Load a tool from a synced package directory.
    ///
    /// Variable resolution, highest priority first: per-request overrides,
    /// statically configured values, manifest defaults. Anything still
    /// missing is asked for on stdin when `interactive` is set, otherwise
    /// it is an error.
    pub async fn load(
        tool_dir: &Path,
        request: &ToolRequest,
        configured_vars: &HashMap<String, String>,
        interactive: bool,
    ) -> Result<Self> {
        let manifest_path = tool_dir.join("pocket.toml");
        let raw = tokio::fs::read_to_string(&manifest_path).await.map_err(|e| {
            PocketError::Manifest(format!(
                "cannot read {}: {}",
                manifest_path.display(),
                e
            ))
        })?;
        let manifest: ToolManifest = toml::from_str(&raw)
            .map_err(|e| PocketError::Manifest(format!("{}: {}", manifest_path.display(), e)))?;

        let schema = match tokio::fs::read_to_string(tool_dir.join("schema.json")).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                serde_json::json!({"type": "object", "properties": {}})
            }
            Err(e) => return Err(e.into()),
        };

        let vars = resolve_vars(
            &manifest.name,
            &manifest.tool_vars,
            &request.overrides,
            configured_vars,
            interactive,
        )?;

        Ok(Tool {
            name: manifest.name,
            description: manifest.description,
            schema,
            auth: manifest.auth,
            runtime: manifest.runtime,
            tool_dir: tool_dir.to_path_buf(),
            vars,
            postprocessors: request.postprocessors.clone(),
        })
    }
}

fn resolve_vars(
    tool_name: &str,
    declared: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
    configured: &HashMap<String, String>,
    interactive: bool,
) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    for (name, default) in declared {
        let value = overrides
            .get(name)
            .or_else(|| configured.get(name))
            .cloned()
            .or_else(|| (!default.is_empty()).then(|| default.clone()));

        let value = match value {
            Some(v) => v,
            None if interactive => prompt_var(tool_name, name)?,
            None => {
                return Err(PocketError::Configuration(format!(
                    "tool `{}` requires variable `{}` and no value was provided",
                    tool_name, name
                )))
            }
        };
        vars.insert(name.clone(), value);
    }
    Ok(vars)
}

fn prompt_var(tool_name: &str, var_name: &str) -> Result<String> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{} requires `{}`: ", tool_name, var_name)?;
    stdout.flush()?;
    let mut value = String::new();
    std::io::stdin().read_line(&mut value)?;
    Ok(value.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name = "send_message"
description = "Send a message to a channel"

[runtime]
type = "python"

[auth]
provider = "slack"
scopes = ["chat:write"]

[tool_vars]
team = ""
region = "us-east-1"
"#;

    async fn write_package(dir: &Path) {
        tokio::fs::write(dir.join("pocket.toml"), MANIFEST)
            .await
            .expect("write manifest");
        tokio::fs::write(
            dir.join("schema.json"),
            r#"{"type":"object","properties":{"text":{"type":"string"}}}"#,
        )
        .await
        .expect("write schema");
    }

    #[tokio::test]
    async fn load_resolves_manifest_and_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_package(dir.path()).await;

        let request = ToolRequest::new(Lock::local(dir.path())).with_overrides(
            [("team".to_string(), "platform".to_string())].into(),
        );
        let tool = Tool::load(dir.path(), &request, &HashMap::new(), false)
            .await
            .expect("load");

        assert_eq!(tool.name, "send_message");
        assert_eq!(tool.vars.get("team").map(String::as_str), Some("platform"));
        assert_eq!(tool.vars.get("region").map(String::as_str), Some("us-east-1"));
        assert_eq!(
            tool.auth.as_ref().and_then(|a| a.provider),
            Some(AuthProvider::Slack)
        );
        assert!(tool.schema["properties"]["text"].is_object());
    }

    #[tokio::test]
    async fn missing_required_var_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_package(dir.path()).await;

        let request = ToolRequest::new(Lock::local(dir.path()));
        let err = Tool::load(dir.path(), &request, &HashMap::new(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("team"));
    }

    #[test]
    fn var_priority_override_beats_configured() {
        let declared = [("key".to_string(), "default".to_string())].into();
        let overrides = [("key".to_string(), "from-override".to_string())].into();
        let configured = [("key".to_string(), "from-config".to_string())].into();

        let vars = resolve_vars("t", &declared, &overrides, &configured, false).expect("resolve");
        assert_eq!(vars.get("key").map(String::as_str), Some("from-override"));

        let vars =
            resolve_vars("t", &declared, &HashMap::new(), &configured, false).expect("resolve");
        assert_eq!(vars.get("key").map(String::as_str), Some("from-config"));

        let vars = resolve_vars("t", &declared, &HashMap::new(), &HashMap::new(), false)
            .expect("resolve");
        assert_eq!(vars.get("key").map(String::as_str), Some("default"));
    }

    #[test]
    fn postprocessor_applies_in_order() {
        let upper = Postprocessor::new("upper", |s| Ok(s.to_uppercase()));
        assert_eq!(upper.apply("ok".to_string()).unwrap(), "OK");
    }
}
