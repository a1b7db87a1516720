// src/config/mod.rs
pub mod ai;
pub mod run;

pub use ai::AiConfig;
pub use run::{
    AnalyzerConfig, BlendStrategy, EmbedderKind, MemoryConfig, OutputConfig, RetrievalMode,
    RunConfig, TimeoutConfig, VectorConfig,
};
