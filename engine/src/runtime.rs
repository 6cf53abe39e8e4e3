//! Runtime API
//!
//! An `Engine` owns at most one loaded model. Loading runs on a blocking task
//! behind an async mutex: a caller arriving while a load is in flight waits
//! for it and receives the same handle. Generation also runs on a blocking
//! task and holds the model lock for the whole call.

use crate::config::ModelConfig;
use crate::device::{self, DeviceMode, DeviceSelection};
use crate::errors::{EngineError, Result};
use crate::generate::{self, GenerationConfig, GenerationResult};
use crate::model::Transformer;
use crate::parallel::{ParallelContext, SingleWorker};
use crate::session::Session;
use crate::stats::InferenceStats;
use crate::weights::WeightStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Externally visible engine state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub is_initialized: bool,
    pub is_loading: bool,
    pub device_mode: Option<DeviceMode>,
    /// Why the fused kernel was not used, when it was requested or possible
    pub downgrade_reason: Option<String>,
}

struct LoadedModel {
    model: Transformer,
    session: Session,
}

/// Shared handle to a loaded model
#[derive(Clone)]
pub struct ModelHandle {
    id: Uuid,
    inner: Arc<Mutex<LoadedModel>>,
    config: Arc<ModelConfig>,
    selection: DeviceSelection,
    is_loading: Arc<AtomicBool>,
    stats: Arc<InferenceStats>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("device_mode", &self.selection.mode)
            .finish()
    }
}

impl ModelHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<InferenceStats> {
        &self.stats
    }

    pub fn status(&self) -> Status {
        Status {
            is_initialized: true,
            is_loading: self.is_loading.load(Ordering::SeqCst),
            device_mode: Some(self.selection.mode),
            downgrade_reason: self
                .selection
                .downgrade_reason
                .as_ref()
                .map(|e| e.to_string()),
        }
    }

    /// Run one batched generation call on a blocking task
    pub async fn generate(
        &self,
        prompts: Vec<Vec<u32>>,
        config: GenerationConfig,
    ) -> Result<GenerationResult> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.blocking_lock();
            let loaded = &mut *guard;
            generate::generate(&mut loaded.model, &mut loaded.session, &prompts, &config)
        })
        .await
        .map_err(|e| EngineError::Task(format!("generation task failed: {}", e)))?
    }

    /// Clear session bookkeeping, including aborted slots
    pub async fn reset(&self) {
        self.inner.lock().await.session.reset();
    }
}

fn load_model(
    config_path: &Path,
    weights_path: &Path,
    stats: Arc<InferenceStats>,
) -> Result<(Transformer, DeviceSelection)> {
    let config = ModelConfig::load(config_path)?;
    let selection = device::select(&config, 1);
    let parallel = ParallelContext::new(1, 0, Arc::new(SingleWorker), stats);
    let store = WeightStore::open(weights_path, &parallel, config.block_size)?;
    let model = Transformer::load(&config, &store, parallel, selection.mode)?;
    Ok((model, selection))
}

/// Owner of at most one loaded model
pub struct Engine {
    loaded: Mutex<Option<ModelHandle>>,
    is_loading: Arc<AtomicBool>,
    stats: Arc<InferenceStats>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            loaded: Mutex::new(None),
            is_loading: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(InferenceStats::new()),
        }
    }

    pub fn stats(&self) -> &Arc<InferenceStats> {
        &self.stats
    }

    /// Load configuration and weights, or return the model already loaded
    pub async fn initialize(
        &self,
        config_path: impl AsRef<Path>,
        weights_path: impl AsRef<Path>,
    ) -> Result<ModelHandle> {
        let mut slot = self.loaded.lock().await;
        if let Some(handle) = slot.as_ref() {
            debug!(handle = %handle.id, "Model already loaded");
            return Ok(handle.clone());
        }

        let config_path: PathBuf = config_path.as_ref().to_path_buf();
        let weights_path: PathBuf = weights_path.as_ref().to_path_buf();
        info!(
            config = %config_path.display(),
            weights = %weights_path.display(),
            "Loading model"
        );

        self.is_loading.store(true, Ordering::SeqCst);
        let stats = self.stats.clone();
        let result =
            tokio::task::spawn_blocking(move || load_model(&config_path, &weights_path, stats))
                .await;
        self.is_loading.store(false, Ordering::SeqCst);

        let (model, selection) =
            result.map_err(|e| EngineError::Task(format!("load task failed: {}", e)))??;

        let config = Arc::new(model.config().clone());
        let handle = ModelHandle {
            id: Uuid::new_v4(),
            inner: Arc::new(Mutex::new(LoadedModel {
                session: Session::new(&config),
                model,
            })),
            config,
            selection,
            is_loading: self.is_loading.clone(),
            stats: self.stats.clone(),
        };
        info!(handle = %handle.id, device_mode = %handle.selection.mode, "Model ready");

        *slot = Some(handle.clone());
        Ok(handle)
    }

    pub async fn status(&self) -> Status {
        if self.is_loading.load(Ordering::SeqCst) {
            return Status {
                is_initialized: false,
                is_loading: true,
                device_mode: None,
                downgrade_reason: None,
            };
        }
        match self.loaded.lock().await.as_ref() {
            Some(handle) => handle.status(),
            None => Status {
                is_initialized: false,
                is_loading: false,
                device_mode: None,
                downgrade_reason: None,
            },
        }
    }
}

/// Load a model on a fresh engine
pub async fn initialize(
    config_path: impl AsRef<Path>,
    weights_path: impl AsRef<Path>,
) -> Result<ModelHandle> {
    Engine::new().initialize(config_path, weights_path).await
}

/// Generate completions for a batch of prompts; EOS is not included
pub async fn generate(
    handle: &ModelHandle,
    prompt_tokens: Vec<Vec<u32>>,
    max_new_tokens: usize,
    temperature: f32,
    eos_id: Option<u32>,
) -> Result<Vec<Vec<u32>>> {
    let config = GenerationConfig {
        max_new_tokens,
        temperature,
        eos_id,
        seed: None,
    };
    Ok(handle.generate(prompt_tokens, config).await?.completions)
}

pub fn status(handle: &ModelHandle) -> Status {
    handle.status()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceRequest, Precision};
    use crate::errors::{ConfigError, GenerationError, WeightLoadError};
    use crate::weights::write_random_checkpoint;

    fn config() -> ModelConfig {
        ModelConfig {
            vocab_size: 32,
            dim: 32,
            inter_dim: 64,
            n_layers: 1,
            n_dense_layers: 1,
            n_heads: 2,
            kv_lora_rank: 16,
            qk_nope_head_dim: 8,
            qk_rope_head_dim: 4,
            v_head_dim: 8,
            max_seq_len: 16,
            max_batch_size: 2,
            block_size: 16,
            ..ModelConfig::default()
        }
    }

    fn write_model(dir: &Path, config: &ModelConfig) -> PathBuf {
        let config_path = dir.join("config.json");
        std::fs::write(&config_path, serde_json::to_string(config).unwrap()).unwrap();
        write_random_checkpoint(dir, config, 1).unwrap();
        config_path
    }

    #[tokio::test]
    async fn test_initialize_generate_status() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_model(dir.path(), &config());

        let handle = initialize(&config_path, dir.path()).await.unwrap();
        let status = status(&handle);
        assert!(status.is_initialized);
        assert!(!status.is_loading);
        assert_eq!(status.device_mode, Some(DeviceMode::Fallback));

        let completions = generate(&handle, vec![vec![1, 2, 3]], 4, 0.0, None)
            .await
            .unwrap();
        assert_eq!(completions[0].len(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_returns_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_model(dir.path(), &config());
        let engine = Engine::new();

        let (a, b) = tokio::join!(
            engine.initialize(&config_path, dir.path()),
            engine.initialize(&config_path, dir.path())
        );
        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert!(engine.status().await.is_initialized);
    }

    #[tokio::test]
    async fn test_status_before_initialize() {
        let engine = Engine::new();
        let status = engine.status().await;
        assert!(!status.is_initialized);
        assert_eq!(status.device_mode, None);
    }

    #[tokio::test]
    async fn test_initialize_errors_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let bad_config = dir.path().join("bad.json");
        std::fs::write(&bad_config, r#"{"dim": 32}"#).unwrap();
        let err = initialize(&bad_config, dir.path()).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::MissingField(_))));

        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, serde_json::to_string(&config()).unwrap()).unwrap();
        let err = initialize(&config_path, dir.path()).await.unwrap_err();
        assert!(matches!(err, EngineError::WeightLoad(WeightLoadError::NoArchives(_))));
    }

    #[tokio::test]
    async fn test_unreadable_config_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = initialize(dir.path().join("nope.json"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::Read { .. })));
    }

    #[tokio::test]
    async fn test_unmappable_archive_is_weight_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, serde_json::to_string(&config()).unwrap()).unwrap();
        // A directory with an archive name opens but cannot be mapped
        std::fs::create_dir(dir.path().join("model.safetensors")).unwrap();

        let err = initialize(&config_path, dir.path()).await.unwrap_err();
        assert!(matches!(err, EngineError::WeightLoad(WeightLoadError::Io { .. })));
    }

    #[tokio::test]
    async fn test_rejected_request_leaves_engine_usable() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_model(dir.path(), &config());
        let handle = initialize(&config_path, dir.path()).await.unwrap();

        // NaN temperature is rejected before any slot is claimed
        let err = generate(&handle, vec![vec![1]], 2, f32::NAN, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Generation(GenerationError::InvalidSampling(_))));
        assert!(generate(&handle, vec![vec![1]], 2, 0.0, None).await.is_ok());

        handle.reset().await;
        assert!(generate(&handle, vec![vec![1]], 2, 0.7, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_downgrade_reason_reported() {
        let dir = tempfile::tempdir().unwrap();
        let quantized = ModelConfig {
            dtype: Precision::Int8,
            device: DeviceRequest::Fused,
            // 24 is not a multiple of the 16-wide block
            kv_lora_rank: 24,
            ..config()
        };
        let config_path = write_model(dir.path(), &quantized);

        let handle = initialize(&config_path, dir.path()).await.unwrap();
        let status = handle.status();
        assert_eq!(status.device_mode, Some(DeviceMode::Fallback));
        assert!(status.downgrade_reason.unwrap().contains("kv_lora_rank"));
    }
}
