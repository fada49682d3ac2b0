//! Model location and runtime settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where the model lives and how the runtime executes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    /// Directory holding the model and tokenizer files. `~/` is expanded.
    pub model_dir: String,
    /// ONNX graph file name inside `model_dir`.
    pub model_file: String,
    /// Tokenizer file name inside `model_dir`.
    pub tokenizer_file: String,
    /// Hugging Face repository to fetch missing files from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_repo: Option<String>,
    /// Intra-op thread count for the ONNX runtime.
    pub intra_threads: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_dir: "~/.phi/models/phi4".to_string(),
            model_file: "model.onnx".to_string(),
            tokenizer_file: "tokenizer.json".to_string(),
            hf_repo: None,
            intra_threads: 4,
        }
    }
}

impl ModelSettings {
    /// `model_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_model_dir(&self) -> PathBuf {
        if let Some(rest) = self.model_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        PathBuf::from(&self.model_dir)
    }

    /// Full path of the ONNX graph.
    pub fn model_path(&self) -> PathBuf {
        self.resolved_model_dir().join(&self.model_file)
    }

    /// Full path of the tokenizer.
    pub fn tokenizer_path(&self) -> PathBuf {
        self.resolved_model_dir().join(&self.tokenizer_file)
    }
}
