//! Safetensors weight store
//!
//! Archives are memory-mapped and indexed by parameter name when the store is
//! opened; tensor bytes are only decoded when a layer asks for them. Linear
//! weights stored as `I8` are paired with a companion `.scale` tensor and come
//! back as `Weight::Quantized`; everything else is converted to `f32`.
//!
//! Sharded parameters may be stored at full shape, in which case this worker's
//! rows or columns are sliced out, or already at shard shape.

use crate::config::ModelConfig;
use crate::errors::{EngineError, Result, WeightLoadError};
use crate::parallel::{shard_range, ParallelContext};
use crate::quant::{QuantizedWeight, Weight};
use crate::tensor_ops::{Tensor1D, Tensor2D};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How a parameter is split across workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shard {
    /// Every worker holds the full tensor
    Replicated,
    /// Output features (rows) are split: column-parallel linear, embedding
    Rows,
    /// Input features (columns) are split: row-parallel linear
    Cols,
}

struct Archive {
    path: PathBuf,
    mmap: Mmap,
    /// Byte offset of the data section
    data_start: usize,
}

#[derive(Debug, Clone)]
struct TensorEntry {
    archive: usize,
    dtype: Dtype,
    shape: Vec<usize>,
    offsets: (usize, usize),
}

/// Memory-mapped tensor archives for one worker
pub struct WeightStore {
    archives: Vec<Archive>,
    index: FxHashMap<String, TensorEntry>,
    world_size: usize,
    rank: usize,
    block_size: usize,
}

impl std::fmt::Debug for WeightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightStore")
            .field("archives", &self.archives.iter().map(|a| &a.path).collect::<Vec<_>>())
            .field("tensors", &self.index.len())
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

fn unreadable(path: &Path, err: std::io::Error) -> EngineError {
    WeightLoadError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
    .into()
}

fn corrupt(path: &Path, reason: impl Into<String>) -> EngineError {
    WeightLoadError::Corrupt {
        path: path.display().to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Archive files to read for `rank` of `world_size`
fn archive_paths(dir: &Path, rank: usize, world_size: usize) -> Result<Vec<PathBuf>> {
    let own = dir.join(format!("model{}-mp{}.safetensors", rank, world_size));
    if own.is_file() {
        return Ok(vec![own]);
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| unreadable(dir, e))? {
        let path = entry.map_err(|e| unreadable(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
            paths.push(path);
        }
    }
    paths.sort();

    if paths.is_empty() {
        return Err(WeightLoadError::NoArchives(dir.display().to_string()).into());
    }
    Ok(paths)
}

impl WeightStore {
    /// Map every archive for this worker and index its tensors
    pub fn open(dir: &Path, parallel: &ParallelContext, block_size: usize) -> Result<Self> {
        if !dir.is_dir() {
            return Err(WeightLoadError::NoArchives(dir.display().to_string()).into());
        }

        let mut archives = Vec::new();
        let mut index = FxHashMap::default();

        for path in archive_paths(dir, parallel.rank, parallel.world_size)? {
            let file = File::open(&path).map_err(|e| unreadable(&path, e))?;
            // SAFETY: the archive is treated as read-only for the store's lifetime
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| unreadable(&path, e))?;

            let (header_len, metadata) =
                SafeTensors::read_metadata(&mmap).map_err(|e| corrupt(&path, e.to_string()))?;
            let data_start = 8 + header_len;

            let archive_id = archives.len();
            for (name, info) in metadata.tensors() {
                index.insert(
                    name,
                    TensorEntry {
                        archive: archive_id,
                        dtype: info.dtype,
                        shape: info.shape.clone(),
                        offsets: info.data_offsets,
                    },
                );
            }

            debug!(path = %path.display(), bytes = mmap.len(), "Mapped weight archive");
            archives.push(Archive {
                path,
                mmap,
                data_start,
            });
        }

        info!(
            archives = archives.len(),
            tensors = index.len(),
            rank = parallel.rank,
            world_size = parallel.world_size,
            "Opened weight store"
        );

        Ok(Self {
            archives,
            index,
            world_size: parallel.world_size,
            rank: parallel.rank,
            block_size,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn entry(&self, name: &str) -> Result<(&TensorEntry, &Archive, &[u8])> {
        let entry = self
            .index
            .get(name)
            .ok_or_else(|| WeightLoadError::MissingTensor(name.to_string()))?;
        let archive = &self.archives[entry.archive];
        let (start, end) = entry.offsets;
        let bytes = archive
            .mmap
            .get(archive.data_start + start..archive.data_start + end)
            .ok_or_else(|| corrupt(&archive.path, format!("tensor `{}` out of bounds", name)))?;
        Ok((entry, archive, bytes))
    }

    fn read_f32(&self, name: &str) -> Result<(Vec<usize>, Vec<f32>)> {
        let (entry, archive, bytes) = self.entry(name)?;
        let values = match entry.dtype {
            Dtype::F32 => bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            Dtype::F16 => bytes
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            Dtype::BF16 => bytes
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            other => {
                return Err(corrupt(
                    &archive.path,
                    format!("tensor `{}` has unsupported dtype {:?}", name, other),
                ))
            }
        };
        Ok((entry.shape.clone(), values))
    }

    fn read_i8(&self, name: &str) -> Result<(Vec<usize>, Vec<i8>)> {
        let (entry, _, bytes) = self.entry(name)?;
        Ok((entry.shape.clone(), bytes.iter().map(|&b| b as i8).collect()))
    }

    /// Local shape of a `[rows, cols]` parameter under `shard`
    fn local_shape(&self, rows: usize, cols: usize, shard: Shard) -> (usize, usize) {
        match shard {
            Shard::Replicated => (rows, cols),
            Shard::Rows => (rows / self.world_size, cols),
            Shard::Cols => (rows, cols / self.world_size),
        }
    }

    /// Whether a stored shape is the full tensor (needs slicing) or already local
    fn classify(
        &self,
        name: &str,
        found: &[usize],
        full: (usize, usize),
        local: (usize, usize),
    ) -> Result<bool> {
        if found == [full.0, full.1] {
            Ok(full != local)
        } else if found == [local.0, local.1] {
            Ok(false)
        } else {
            Err(WeightLoadError::ShapeMismatch {
                name: name.to_string(),
                expected: vec![full.0, full.1],
                found: found.to_vec(),
            }
            .into())
        }
    }

    /// Full-precision vector of exactly `len` elements
    pub fn vector(&self, name: &str, len: usize) -> Result<Tensor1D> {
        let (shape, data) = self.read_f32(name)?;
        if shape != [len] {
            return Err(WeightLoadError::ShapeMismatch {
                name: name.to_string(),
                expected: vec![len],
                found: shape,
            }
            .into());
        }
        Ok(Tensor1D::new(data))
    }

    /// Full-precision matrix, sliced to this worker's shard when stored whole
    pub fn matrix(&self, name: &str, rows: usize, cols: usize, shard: Shard) -> Result<Tensor2D> {
        let (shape, data) = self.read_f32(name)?;
        let local = self.local_shape(rows, cols, shard);
        let slice = self.classify(name, &shape, (rows, cols), local)?;
        let tensor = Tensor2D::new(data, shape[0], shape[1])?;
        if !slice {
            return Ok(tensor);
        }
        match shard {
            Shard::Rows => {
                let range = shard_range(rows, self.world_size, self.rank);
                tensor.row_slice(range.start, range.end)
            }
            Shard::Cols => {
                let range = shard_range(cols, self.world_size, self.rank);
                tensor.column_slice(range.start, range.end)
            }
            Shard::Replicated => Ok(tensor),
        }
    }

    /// Linear weight `{prefix}.weight`, quantized when stored as `I8`
    pub fn weight(&self, prefix: &str, rows: usize, cols: usize, shard: Shard) -> Result<Weight> {
        let name = format!("{}.weight", prefix);
        let (entry, _, _) = self.entry(&name)?;
        if entry.dtype != Dtype::I8 {
            return Ok(Weight::Dense(self.matrix(&name, rows, cols, shard)?));
        }

        let (shape, values) = self.read_i8(&name)?;
        let local = self.local_shape(rows, cols, shard);
        let slice = self.classify(&name, &shape, (rows, cols), local)?;

        let scale_name = format!("{}.scale", prefix);
        let bs = self.block_size;
        let (scale_shape, scale_data) = self.read_f32(&scale_name)?;
        let grid = (shape[0].div_ceil(bs), shape[1].div_ceil(bs));
        if scale_shape != [grid.0, grid.1] {
            return Err(WeightLoadError::ShapeMismatch {
                name: scale_name,
                expected: vec![grid.0, grid.1],
                found: scale_shape,
            }
            .into());
        }

        let stored = QuantizedWeight::new(
            values,
            Tensor2D::new(scale_data, grid.0, grid.1)?,
            shape[0],
            shape[1],
            bs,
        )?;
        if !slice {
            return Ok(Weight::Quantized(stored));
        }

        let (total, range) = match shard {
            Shard::Rows => (rows, shard_range(rows, self.world_size, self.rank)),
            Shard::Cols => (cols, shard_range(cols, self.world_size, self.rank)),
            Shard::Replicated => return Ok(Weight::Quantized(stored)),
        };
        if range.start % bs != 0 || (range.end % bs != 0 && range.end != total) {
            return Err(WeightLoadError::Unshardable {
                name,
                reason: format!(
                    "shard {}..{} is not aligned to block size {}",
                    range.start, range.end, bs
                ),
            }
            .into());
        }
        let sliced = match shard {
            Shard::Rows => stored.row_slice(range.start, range.end)?,
            _ => stored.column_slice(range.start, range.end)?,
        };
        Ok(Weight::Quantized(sliced))
    }
}

/// Xavier-uniform `[rows, cols]` matrix
pub fn xavier_tensor(rows: usize, cols: usize, rng: &mut StdRng) -> Tensor2D {
    let limit = (6.0 / (rows + cols) as f32).sqrt();
    let data = (0..rows * cols)
        .map(|_| rng.gen_range(-limit..limit))
        .collect();
    Tensor2D {
        data,
        rows,
        cols,
    }
}

/// Encoded tensor waiting to be serialized
struct PendingTensor {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

struct CheckpointWriter<'a> {
    config: &'a ModelConfig,
    rng: StdRng,
    tensors: Vec<PendingTensor>,
}

impl CheckpointWriter<'_> {
    fn push_f32(&mut self, name: String, shape: Vec<usize>, data: &[f32]) {
        self.tensors.push(PendingTensor {
            name,
            dtype: Dtype::F32,
            shape,
            bytes: data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        });
    }

    fn norm(&mut self, name: String, len: usize) {
        self.push_f32(name, vec![len], &vec![1.0; len]);
    }

    fn dense(&mut self, name: String, rows: usize, cols: usize) {
        let tensor = xavier_tensor(rows, cols, &mut self.rng);
        self.push_f32(name, vec![rows, cols], &tensor.data);
    }

    /// Linear layer, quantized when the checkpoint precision is int8
    fn linear(&mut self, prefix: String, rows: usize, cols: usize) -> Result<()> {
        let tensor = xavier_tensor(rows, cols, &mut self.rng);
        if !self.config.is_quantized() {
            self.push_f32(format!("{}.weight", prefix), vec![rows, cols], &tensor.data);
            return Ok(());
        }

        let quantized = QuantizedWeight::quantize(&tensor, self.config.block_size)?;
        self.tensors.push(PendingTensor {
            name: format!("{}.weight", prefix),
            dtype: Dtype::I8,
            shape: vec![rows, cols],
            bytes: quantized.values.iter().map(|&v| v as u8).collect(),
        });
        let scale = quantized.scale;
        self.push_f32(
            format!("{}.scale", prefix),
            vec![scale.rows, scale.cols],
            &scale.data,
        );
        Ok(())
    }

    fn swiglu(&mut self, prefix: &str, dim: usize, inter: usize) -> Result<()> {
        self.linear(format!("{}.w1", prefix), inter, dim)?;
        self.linear(format!("{}.w2", prefix), dim, inter)?;
        self.linear(format!("{}.w3", prefix), inter, dim)
    }

    fn layer(&mut self, i: usize) -> Result<()> {
        let c = self.config;
        let heads = c.n_heads;
        let p = format!("layers.{}", i);

        self.norm(format!("{}.attn_norm.weight", p), c.dim);
        self.norm(format!("{}.ffn_norm.weight", p), c.dim);

        if c.q_lora_rank == 0 {
            self.linear(format!("{}.attn.wq", p), heads * c.qk_head_dim(), c.dim)?;
        } else {
            self.linear(format!("{}.attn.wq_a", p), c.q_lora_rank, c.dim)?;
            self.norm(format!("{}.attn.q_norm.weight", p), c.q_lora_rank);
            self.linear(format!("{}.attn.wq_b", p), heads * c.qk_head_dim(), c.q_lora_rank)?;
        }
        self.linear(
            format!("{}.attn.wkv_a", p),
            c.kv_lora_rank + c.qk_rope_head_dim,
            c.dim,
        )?;
        self.norm(format!("{}.attn.kv_norm.weight", p), c.kv_lora_rank);
        self.linear(
            format!("{}.attn.wkv_b", p),
            heads * (c.qk_nope_head_dim + c.v_head_dim),
            c.kv_lora_rank,
        )?;
        self.linear(format!("{}.attn.wo", p), c.dim, heads * c.v_head_dim)?;

        if i < c.n_dense_layers {
            return self.swiglu(&format!("{}.ffn", p), c.dim, c.inter_dim);
        }

        self.dense(format!("{}.ffn.gate.weight", p), c.n_routed_experts, c.dim);
        if c.gate_has_bias() {
            let zeros = vec![0.0; c.n_routed_experts];
            self.push_f32(format!("{}.ffn.gate.bias", p), vec![c.n_routed_experts], &zeros);
        }
        for e in 0..c.n_routed_experts {
            self.swiglu(&format!("{}.ffn.experts.{}", p, e), c.dim, c.moe_inter_dim)?;
        }
        self.swiglu(
            &format!("{}.ffn.shared_experts", p),
            c.dim,
            c.n_shared_experts * c.moe_inter_dim,
        )
    }
}

/// Write a deterministic Xavier-initialized checkpoint for `config` into `dir`.
///
/// All tensors are stored at full shape in `model.safetensors`; workers slice
/// their shards at load time.
pub fn write_random_checkpoint(dir: &Path, config: &ModelConfig, seed: u64) -> Result<PathBuf> {
    config.validate(1)?;
    std::fs::create_dir_all(dir)?;

    let mut writer = CheckpointWriter {
        config,
        rng: StdRng::seed_from_u64(seed),
        tensors: Vec::new(),
    };

    writer.dense("embed.weight".to_string(), config.vocab_size, config.dim);
    for i in 0..config.n_layers {
        writer.layer(i)?;
    }
    writer.norm("norm.weight".to_string(), config.dim);
    writer.dense("head.weight".to_string(), config.vocab_size, config.dim);

    let path = dir.join("model.safetensors");
    let views = writer
        .tensors
        .iter()
        .map(|t| {
            TensorView::new(t.dtype, t.shape.clone(), &t.bytes)
                .map(|view| (t.name.clone(), view))
                .map_err(|e| corrupt(&path, e.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;
    safetensors::serialize_to_file(views, &None, &path).map_err(|e| corrupt(&path, e.to_string()))?;

    info!(
        path = %path.display(),
        tensors = writer.tensors.len(),
        dtype = %config.dtype,
        seed,
        "Wrote random checkpoint"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::parallel::SingleWorker;
    use crate::stats::InferenceStats;
    use std::sync::Arc;

    fn small_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 64,
            dim: 32,
            inter_dim: 64,
            moe_inter_dim: 16,
            n_layers: 2,
            n_dense_layers: 1,
            n_heads: 4,
            n_routed_experts: 4,
            n_shared_experts: 1,
            n_activated_experts: 2,
            kv_lora_rank: 16,
            qk_nope_head_dim: 8,
            qk_rope_head_dim: 4,
            v_head_dim: 8,
            max_seq_len: 32,
            max_batch_size: 2,
            block_size: 16,
            ..ModelConfig::default()
        }
    }

    fn worker(world_size: usize, rank: usize) -> ParallelContext {
        ParallelContext::new(
            world_size,
            rank,
            Arc::new(SingleWorker),
            Arc::new(InferenceStats::new()),
        )
    }

    #[test]
    fn test_xavier_bounds_and_determinism() {
        let a = xavier_tensor(10, 20, &mut StdRng::seed_from_u64(1));
        let b = xavier_tensor(10, 20, &mut StdRng::seed_from_u64(1));
        let limit = (6.0f32 / 30.0).sqrt();

        assert_eq!(a, b);
        assert!(a.data.iter().all(|v| v.abs() <= limit));
    }

    #[test]
    fn test_empty_directory_has_no_archives() {
        let dir = tempfile::tempdir().unwrap();
        let err = WeightStore::open(dir.path(), &ParallelContext::single(), 128).unwrap_err();
        assert!(matches!(err, EngineError::WeightLoad(WeightLoadError::NoArchives(_))));
    }

    #[test]
    fn test_corrupt_archive_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"not an archive").unwrap();

        let err = WeightStore::open(dir.path(), &ParallelContext::single(), 128).unwrap_err();
        assert!(matches!(err, EngineError::WeightLoad(WeightLoadError::Corrupt { .. })));
    }

    #[test]
    fn test_random_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config();
        write_random_checkpoint(dir.path(), &config, 7).unwrap();

        let store = WeightStore::open(dir.path(), &ParallelContext::single(), 16).unwrap();
        assert!(store.contains("embed.weight"));
        assert!(store.contains("layers.1.ffn.experts.3.w2.weight"));
        assert!(!store.contains("layers.0.ffn.gate.weight"));

        let norm = store.vector("norm.weight", 32).unwrap();
        assert!(norm.data.iter().all(|&v| v == 1.0));

        let wo = store.weight("layers.0.attn.wo", 32, 32, Shard::Replicated).unwrap();
        assert!(!wo.is_quantized());
        assert_eq!((wo.rows(), wo.cols()), (32, 32));
    }

    #[test]
    fn test_missing_tensor_and_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_random_checkpoint(dir.path(), &small_config(), 7).unwrap();
        let store = WeightStore::open(dir.path(), &ParallelContext::single(), 16).unwrap();

        let err = store.vector("layers.9.attn_norm.weight", 32).unwrap_err();
        assert!(matches!(err, EngineError::WeightLoad(WeightLoadError::MissingTensor(_))));

        let err = store.matrix("embed.weight", 65, 32, Shard::Replicated).unwrap_err();
        assert!(matches!(err, EngineError::WeightLoad(WeightLoadError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_full_shape_tensors_are_sliced_per_rank() {
        let dir = tempfile::tempdir().unwrap();
        write_random_checkpoint(dir.path(), &small_config(), 7).unwrap();

        let full = WeightStore::open(dir.path(), &ParallelContext::single(), 16)
            .unwrap()
            .matrix("embed.weight", 64, 32, Shard::Replicated)
            .unwrap();
        let rank1 = WeightStore::open(dir.path(), &worker(2, 1), 16)
            .unwrap()
            .matrix("embed.weight", 64, 32, Shard::Rows)
            .unwrap();
        assert_eq!(rank1, full.row_slice(32, 64).unwrap());

        let cols = WeightStore::open(dir.path(), &worker(2, 0), 16)
            .unwrap()
            .matrix("embed.weight", 64, 32, Shard::Cols)
            .unwrap();
        assert_eq!(cols, full.column_slice(0, 16).unwrap());
    }

    #[test]
    fn test_quantized_checkpoint_loads_tagged_weights() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            dtype: Precision::Int8,
            ..small_config()
        };
        write_random_checkpoint(dir.path(), &config, 3).unwrap();

        let store = WeightStore::open(dir.path(), &worker(2, 1), 16).unwrap();
        let w1 = store.weight("layers.0.ffn.w1", 64, 32, Shard::Rows).unwrap();
        assert!(w1.is_quantized());
        assert_eq!((w1.rows(), w1.cols()), (32, 32));

        // Gate and head stay full precision
        let head = store.weight("head", 64, 32, Shard::Rows).unwrap();
        assert!(!head.is_quantized());
    }

    #[test]
    fn test_unaligned_quantized_shard_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            dtype: Precision::Int8,
            block_size: 32,
            ..small_config()
        };
        write_random_checkpoint(dir.path(), &config, 3).unwrap();

        // 64 rows over 4 workers gives 16-row shards, rank 1 starts mid-block
        let store = WeightStore::open(dir.path(), &worker(4, 1), 32).unwrap();
        let err = store
            .weight("layers.0.ffn.w1", 64, 32, Shard::Rows)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::WeightLoad(WeightLoadError::Unshardable { .. })
        ));
    }

    #[test]
    fn test_own_rank_archive_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config();
        write_random_checkpoint(dir.path(), &config, 1).unwrap();
        std::fs::rename(
            dir.path().join("model.safetensors"),
            dir.path().join("model0-mp1.safetensors"),
        )
        .unwrap();
        std::fs::write(dir.path().join("other.safetensors"), b"garbage").unwrap();

        // The garbage file is never opened
        let store = WeightStore::open(dir.path(), &ParallelContext::single(), 16).unwrap();
        assert!(store.contains("head.weight"));
    }
}
