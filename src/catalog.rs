// ABOUTME: Model catalog: resolves a model name to its executable, model file, and arguments.
// ABOUTME: Built once from configuration; read-only for the rest of the run.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Default marker llama.cpp prints when it hands control back to the user.
pub const DEFAULT_PROMPT_MARKER: &str = "\n> ";

/// Default line-submission convention for `--multiline-input`: a trailing `/`
/// returns control to the model.
pub const DEFAULT_SUBMIT_SENTINEL: &str = "/\n";

/// How to launch one model, as declared in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub executable: PathBuf,
    pub model_file: PathBuf,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Per-model override of the global thread count.
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub first_output_timeout_ms: Option<u64>,
    /// Set to an empty string to disable marker framing and rely on idle timeout alone.
    #[serde(default = "default_prompt_marker")]
    pub prompt_marker: String,
    #[serde(default = "default_submit_sentinel")]
    pub submit_sentinel: String,
}

fn default_prompt_marker() -> String {
    DEFAULT_PROMPT_MARKER.to_string()
}

fn default_submit_sentinel() -> String {
    DEFAULT_SUBMIT_SENTINEL.to_string()
}

impl ModelDescriptor {
    /// Minimal descriptor with default framing, mostly useful in tests.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        model_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            model_file: model_file.into(),
            extra_args: Vec::new(),
            threads: None,
            idle_timeout_ms: None,
            first_output_timeout_ms: None,
            prompt_marker: default_prompt_marker(),
            submit_sentinel: default_submit_sentinel(),
        }
    }

    /// Command-line arguments for an interactive session with `threads` workers.
    pub fn build_args(&self, threads: u32) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            threads.to_string(),
            "-m".to_string(),
            self.model_file.to_string_lossy().to_string(),
            "--interactive-first".to_string(),
            "--multiline-input".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Immutable name → descriptor mapping.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelDescriptor>,
}

impl ModelCatalog {
    /// Build a catalog, rejecting empty names, duplicate names, and empty sentinels.
    pub fn new(descriptors: Vec<ModelDescriptor>) -> Result<Self> {
        let mut models = BTreeMap::new();
        for descriptor in descriptors {
            if descriptor.name.trim().is_empty() {
                return Err(SessionError::Config("model name must not be empty".into()));
            }
            if descriptor.submit_sentinel.is_empty() {
                return Err(SessionError::Config(format!(
                    "model '{}' has an empty submit_sentinel",
                    descriptor.name
                )));
            }
            if models.contains_key(&descriptor.name) {
                return Err(SessionError::Config(format!(
                    "model '{}' is declared more than once",
                    descriptor.name
                )));
            }
            models.insert(descriptor.name.clone(), descriptor);
        }
        Ok(Self { models })
    }

    pub fn resolve(&self, name: &str) -> Result<ModelDescriptor> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(name.to_string()))
    }

    /// Configured model names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llama() -> ModelDescriptor {
        ModelDescriptor::new("LLaMA-v2", "/opt/llama/main", "/models/llama-2-7b.gguf")
    }

    #[test]
    fn resolve_known_model() {
        let catalog = ModelCatalog::new(vec![llama()]).unwrap();
        let found = catalog.resolve("LLaMA-v2").unwrap();
        assert_eq!(found.model_file, PathBuf::from("/models/llama-2-7b.gguf"));
    }

    #[test]
    fn resolve_unknown_model_is_not_found() {
        let catalog = ModelCatalog::new(vec![llama()]).unwrap();
        assert_eq!(
            catalog.resolve("missing"),
            Err(SessionError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = ModelCatalog::new(vec![llama(), llama()]).unwrap_err();
        assert!(matches!(err, SessionError::Config(msg) if msg.contains("more than once")));
    }

    #[test]
    fn empty_sentinel_rejected() {
        let mut model = llama();
        model.submit_sentinel.clear();
        assert!(ModelCatalog::new(vec![model]).is_err());
    }

    #[test]
    fn args_put_threads_and_model_before_extras() {
        let mut model = llama();
        model.extra_args = vec!["--temp".to_string(), "0.7".to_string()];
        let args = model.build_args(6);
        assert_eq!(
            args,
            vec![
                "-t",
                "6",
                "-m",
                "/models/llama-2-7b.gguf",
                "--interactive-first",
                "--multiline-input",
                "--temp",
                "0.7",
            ]
        );
    }

    #[test]
    fn names_are_sorted() {
        let catalog = ModelCatalog::new(vec![
            ModelDescriptor::new("zephyr", "/bin/z", "/m/z"),
            ModelDescriptor::new("alpaca", "/bin/a", "/m/a"),
        ])
        .unwrap();
        assert_eq!(catalog.names(), vec!["alpaca", "zephyr"]);
        assert_eq!(catalog.len(), 2);
    }
}
