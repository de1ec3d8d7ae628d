//! How tools execute: subprocesses on the host or throwaway containers
//!
//! Every tool runs out of process. The invocation body goes in on stdin as
//! JSON, the result comes back as the process's stdout.

mod container;
mod process;

pub use container::ContainerRuntime;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::tool::Tool;

const PYTHON_ENTRYPOINT: &str = "python3 main.py";
const NODE_ENTRYPOINT: &str = "node index.js";
const WASM_ENTRYPOINT: &str = "wasmtime main.wasm";

/// Execution mode a manifest declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuntimeSpec {
    Python {
        /// Shell command overriding `python3 main.py`
        #[serde(default)]
        entrypoint: Option<String>,
    },
    Node {
        /// Shell command overriding `node index.js`
        #[serde(default)]
        entrypoint: Option<String>,
    },
    /// WebAssembly module run through the host's wasm runtime
    Wasm {
        /// Shell command overriding `wasmtime main.wasm`
        #[serde(default)]
        entrypoint: Option<String>,
    },
    Container {
        image: String,
        /// Command run inside the container instead of the image default
        #[serde(default)]
        entrypoint: Option<String>,
    },
}

/// Dispatches invocations to the right execution mode
#[derive(Default)]
pub struct ToolRuntime {
    containers: ContainerRuntime,
}

impl ToolRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute `tool` with `body` on stdin and `envs` merged over the tool's
    /// own variables. Returns the process's stdout.
    pub async fn invoke(
        &self,
        tool: &Tool,
        body: &str,
        envs: &HashMap<String, String>,
    ) -> Result<String> {
        let mut merged = tool.vars.clone();
        merged.extend(envs.iter().map(|(k, v)| (k.clone(), v.clone())));

        match &tool.runtime {
            RuntimeSpec::Python { entrypoint } => {
                let command = entrypoint.as_deref().unwrap_or(PYTHON_ENTRYPOINT);
                process::run_shell(command, &tool.tool_dir, &merged, body).await
            }
            RuntimeSpec::Node { entrypoint } => {
                let command = entrypoint.as_deref().unwrap_or(NODE_ENTRYPOINT);
                process::run_shell(command, &tool.tool_dir, &merged, body).await
            }
            RuntimeSpec::Wasm { entrypoint } => {
                let command = entrypoint.as_deref().unwrap_or(WASM_ENTRYPOINT);
                process::run_shell(command, &tool.tool_dir, &merged, body).await
            }
            RuntimeSpec::Container { image, entrypoint } => {
                self.containers
                    .run(image, entrypoint.as_deref(), &tool.tool_dir, &merged, body)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_spec_parses_from_manifest_toml() {
        #[derive(Deserialize)]
        struct Probe {
            runtime: RuntimeSpec,
        }

        let probe: Probe = toml::from_str("[runtime]\ntype = \"python\"\n").expect("parse");
        assert_eq!(probe.runtime, RuntimeSpec::Python { entrypoint: None });

        let probe: Probe = toml::from_str("[runtime]\ntype = \"wasm\"\n").expect("parse");
        assert_eq!(probe.runtime, RuntimeSpec::Wasm { entrypoint: None });

        let probe: Probe = toml::from_str(
            "[runtime]\ntype = \"container\"\nimage = \"ghcr.io/org/tool:1\"\n",
        )
        .expect("parse");
        assert_eq!(
            probe.runtime,
            RuntimeSpec::Container {
                image: "ghcr.io/org/tool:1".to_string(),
                entrypoint: None,
            }
        );
    }

    #[tokio::test]
    async fn wasm_runtime_dispatches_out_of_process() {
        let tool = Tool {
            name: "wasm-tool".to_string(),
            description: String::new(),
            schema: serde_json::json!({}),
            auth: None,
            runtime: RuntimeSpec::Wasm {
                entrypoint: Some("cat >/dev/null; printf wasm-ok".to_string()),
            },
            tool_dir: ".".into(),
            vars: HashMap::new(),
            postprocessors: Vec::new(),
        };
        let out = ToolRuntime::new()
            .invoke(&tool, "{}", &HashMap::new())
            .await
            .expect("invoke");
        assert_eq!(out, "wasm-ok");
    }
}
