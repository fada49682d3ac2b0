//! ONNX Runtime engine (feature-gated behind `ort`).
//!
//! Loads a causal language model exported to ONNX (inputs `input_ids` and
//! `attention_mask`, first output the logits) plus its `tokenizer.json`.
//! Decoding is greedy and re-runs the full sequence every step.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::{EngineLoader, GeneratorParams, InferenceEngine, TokenDecoder, TokenGenerator};
use crate::errors::{EngineError, Result};

/// Engine backed by an ONNX Runtime session.
pub struct OnnxEngine {
    session: Arc<Mutex<ort::session::Session>>,
    tokenizer: Arc<tokenizers::Tokenizer>,
    stop_ids: Arc<[u32]>,
}

impl OnnxEngine {
    /// Load model and tokenizer synchronously.
    ///
    /// Blocking: reads (and possibly downloads) large files.
    pub fn load_blocking(config: &EngineConfig) -> Result<Self> {
        let (model_path, tokenizer_path) = resolve_model_files(config)?;

        info!(model = %model_path.display(), "loading ONNX model");

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EngineError::ModelInit(format!("tokenizer load: {e}")))?;

        let session = ort::session::Session::builder()
            .map_err(|e| EngineError::ModelInit(format!("session builder: {e}")))?
            .with_intra_threads(config.intra_threads)
            .map_err(|e| EngineError::ModelInit(format!("thread config: {e}")))?
            .with_log_level(ort::logging::LogLevel::Warning)
            .map_err(|e| EngineError::ModelInit(format!("log level: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| EngineError::ModelInit(format!("model load: {e}")))?;

        let stop_ids: Vec<u32> = config
            .stop_tokens
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .collect();
        debug!(?stop_ids, "stop token ids resolved");

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            stop_ids: stop_ids.into(),
        })
    }
}

/// Local files if present, otherwise download through `hf-hub`.
fn resolve_model_files(config: &EngineConfig) -> Result<(PathBuf, PathBuf)> {
    if let Some(files) = config.local_files() {
        return Ok(files);
    }
    let Some(repo_id) = config.hf_repo.clone() else {
        return Err(EngineError::ModelInit(format!(
            "model files not found in {} and no hfRepo configured",
            config.model_dir.display()
        )));
    };

    debug!(cache_dir = %config.model_dir.display(), repo = %repo_id, "downloading model via hf-hub");

    let api = hf_hub::api::sync::ApiBuilder::new()
        .with_cache_dir(config.model_dir.clone())
        .build()
        .map_err(|e| EngineError::ModelInit(format!("hf-hub api: {e}")))?;
    let repo = api.model(repo_id);

    let model_path = repo
        .get(&config.model_file)
        .map_err(|e| EngineError::ModelInit(format!("model download ({}): {e}", config.model_file)))?;
    let tokenizer_path = repo
        .get(&config.tokenizer_file)
        .map_err(|e| EngineError::ModelInit(format!("tokenizer download: {e}")))?;

    info!(model = %model_path.display(), tokenizer = %tokenizer_path.display(), "model files ready");
    Ok((model_path, tokenizer_path))
}

impl InferenceEngine for OnnxEngine {
    fn is_ready(&self) -> bool {
        true
    }

    fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| EngineError::Inference(format!("tokenize: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn create_generator(&self, params: &GeneratorParams) -> Result<Box<dyn TokenGenerator>> {
        if params.batch_size != 1 {
            return Err(EngineError::Inference(format!(
                "batch size {} not supported, expected 1",
                params.batch_size
            )));
        }
        Ok(Box::new(OnnxGenerator {
            session: Arc::clone(&self.session),
            stop_ids: Arc::clone(&self.stop_ids),
            max_length: params.max_length,
            ids: Vec::new(),
            generated: 0,
            finished: false,
        }))
    }

    fn create_decoder(&self) -> Result<Box<dyn TokenDecoder>> {
        Ok(Box::new(OnnxDecoder {
            tokenizer: Arc::clone(&self.tokenizer),
            ids: Vec::new(),
            emitted: 0,
        }))
    }
}

struct OnnxGenerator {
    session: Arc<Mutex<ort::session::Session>>,
    stop_ids: Arc<[u32]>,
    max_length: usize,
    ids: Vec<u32>,
    generated: usize,
    finished: bool,
}

impl TokenGenerator for OnnxGenerator {
    fn append_tokens(&mut self, tokens: &[u32]) -> Result<()> {
        self.ids.extend_from_slice(tokens);
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.finished || self.ids.is_empty() || self.ids.len() >= self.max_length
    }

    fn step(&mut self) -> Result<()> {
        let next = {
            let mut session = self.session.lock();
            next_token(&mut session, &self.ids)?
        };
        self.ids.push(next);
        self.generated += 1;
        if self.stop_ids.contains(&next) {
            self.finished = true;
        }
        Ok(())
    }

    fn last_token(&self) -> Result<u32> {
        if self.generated == 0 {
            return Err(EngineError::Inference("no token generated yet".into()));
        }
        self.ids
            .last()
            .copied()
            .ok_or_else(|| EngineError::Inference("empty sequence".into()))
    }
}

/// Run the model over `ids` and pick the most likely next token.
fn next_token(session: &mut ort::session::Session, ids: &[u32]) -> Result<u32> {
    let input_ids: Vec<i64> = ids.iter().map(|&id| i64::from(id)).collect();
    let attention_mask = vec![1i64; ids.len()];

    #[allow(clippy::cast_possible_wrap)]
    let shape = vec![1i64, ids.len() as i64];

    let input_ids_tensor = ort::value::Tensor::from_array((shape.clone(), input_ids))
        .map_err(|e| EngineError::Inference(format!("input_ids tensor: {e}")))?;
    let attention_mask_tensor = ort::value::Tensor::from_array((shape, attention_mask))
        .map_err(|e| EngineError::Inference(format!("attention_mask tensor: {e}")))?;

    let outputs = session
        .run(ort::inputs![
            "input_ids" => input_ids_tensor,
            "attention_mask" => attention_mask_tensor
        ])
        .map_err(|e| EngineError::Inference(format!("inference: {e}")))?;

    // logits: [1, seq_len, vocab]
    let (shape, logits) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| EngineError::Inference(format!("extract logits: {e}")))?;
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    if dims.len() != 3 || dims[0] != 1 || dims[1] == 0 {
        return Err(EngineError::Inference(format!(
            "unexpected logits shape: {shape:?}"
        )));
    }
    let vocab = dims[2];
    let start = (dims[1] - 1) * vocab;
    logits
        .get(start..start + vocab)
        .and_then(argmax)
        .ok_or_else(|| EngineError::Inference("logits buffer shorter than its shape".into()))
}

fn argmax(row: &[f32]) -> Option<u32> {
    let (index, _) = row
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))?;
    u32::try_from(index).ok()
}

struct OnnxDecoder {
    tokenizer: Arc<tokenizers::Tokenizer>,
    ids: Vec<u32>,
    emitted: usize,
}

impl TokenDecoder for OnnxDecoder {
    fn decode(&mut self, token: u32) -> Result<String> {
        self.ids.push(token);
        let text = self
            .tokenizer
            .decode(&self.ids, false)
            .map_err(|e| EngineError::Inference(format!("detokenize: {e}")))?;
        Ok(take_suffix(&text, &mut self.emitted))
    }
}

/// Text decoded since the last call, holding back an incomplete character.
fn take_suffix(text: &str, emitted: &mut usize) -> String {
    if text.ends_with('\u{FFFD}') {
        return String::new();
    }
    let start = if text.is_char_boundary(*emitted) {
        *emitted
    } else {
        // detokenizer rewrote emitted text; resume at the previous boundary
        let start = (0..=(*emitted).min(text.len()))
            .rev()
            .find(|&i| text.is_char_boundary(i))
            .unwrap_or(0);
        debug!(emitted = *emitted, len = text.len(), start, "decoded text shifted");
        start
    };
    let suffix = text[start..].to_string();
    *emitted = text.len();
    suffix
}

/// Loader for [`OnnxEngine`]; model loading runs on the blocking pool.
pub struct OnnxLoader {
    config: EngineConfig,
}

impl OnnxLoader {
    /// Loader for the model described by `config`.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineLoader for OnnxLoader {
    async fn load(&self) -> Result<Arc<dyn InferenceEngine>> {
        let config = self.config.clone();
        let engine = tokio::task::spawn_blocking(move || OnnxEngine::load_blocking(&config))
            .await
            .map_err(|e| EngineError::Internal(format!("join error: {e}")))??;
        info!("ONNX engine ready");
        Ok(Arc::new(engine))
    }
}
