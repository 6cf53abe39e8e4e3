pub mod attention;
pub mod config;
pub mod device;
pub mod errors;
pub mod generate;
pub mod kv_cache;
pub mod model;
pub mod moe;
pub mod observability;
pub mod parallel;
pub mod quant;
pub mod rope;
pub mod runtime;
pub mod session;
pub mod stats;
pub mod tensor_ops;
pub mod weights;

pub use config::{AttnImpl, DeviceRequest, ModelConfig, Precision, ScoreFunc};
pub use device::{DeviceMode, DeviceSelection};
pub use errors::{
    ConfigError, DeviceError, EngineError, GenerationError, Result, WeightLoadError,
};
pub use generate::{GenerationConfig, GenerationResult, Sampler};
pub use model::Transformer;
pub use observability::{init_production_logging, init_simple_logging};
pub use parallel::{Collective, LocalRing, ParallelContext, RingMember, SingleWorker};
pub use runtime::{Engine, ModelHandle, Status};
pub use session::{Phase, Session, SlotState};
pub use stats::InferenceStats;
pub use tensor_ops::{Tensor1D, Tensor2D};
pub use weights::{write_random_checkpoint, WeightStore};
