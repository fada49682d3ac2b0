//! Engine configuration.

use std::path::PathBuf;

use phi_settings::PhiSettings;

/// Model location and runtime options for a real inference engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Directory holding the model files, already tilde-expanded.
    pub model_dir: PathBuf,
    /// ONNX graph file name.
    pub model_file: String,
    /// Tokenizer file name.
    pub tokenizer_file: String,
    /// Hugging Face repository to fetch missing files from.
    pub hf_repo: Option<String>,
    /// Intra-op thread count.
    pub intra_threads: usize,
    /// Token strings whose ids end generation.
    pub stop_tokens: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&PhiSettings::default())
    }
}

impl EngineConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &PhiSettings) -> Self {
        Self {
            model_dir: settings.model.resolved_model_dir(),
            model_file: settings.model.model_file.clone(),
            tokenizer_file: settings.model.tokenizer_file.clone(),
            hf_repo: settings.model.hf_repo.clone(),
            intra_threads: settings.model.intra_threads,
            stop_tokens: std::iter::once(&settings.template.end_token)
                .chain(&settings.template.stop_tokens)
                .cloned()
                .collect(),
        }
    }

    /// Model graph path inside `model_dir`.
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_file)
    }

    /// Tokenizer path inside `model_dir`.
    pub fn tokenizer_path(&self) -> PathBuf {
        self.model_dir.join(&self.tokenizer_file)
    }

    /// Both files, if they are already present locally.
    pub fn local_files(&self) -> Option<(PathBuf, PathBuf)> {
        let model = self.model_path();
        let tokenizer = self.tokenizer_path();
        (model.is_file() && tokenizer.is_file()).then_some((model, tokenizer))
    }
}
