//! Content-based knowledge graph embedding and ranking
//!
//! This crate trains and evaluates a link-prediction model that scores
//! (head, relation, tail) triples from the textual content attached to
//! entities: free-text descriptions and short titles. Descriptions are run
//! through a relation-masked convolutional extractor, titles are averaged,
//! and four cosine-style similarities between the head and tail
//! representations are combined with a learned weight per channel.
//!
//! Modules:
//! - [`content`]: vocabulary, word-embedding table, description/title store
//! - [`dataset`]: triples, per-relation target pools, filter indexes
//! - [`models`]: the content-mask model and its building blocks
//! - [`target_cache`]: reusable buffer of precomputed target representations
//! - [`evaluation`]: filtered-rank evaluation and the metrics report
//! - [`training`]: batched training loop with checkpoint cadence
//! - [`persistence`]: checkpoint manager and report export

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod content;
pub mod dataset;
pub mod evaluation;
pub mod models;
pub mod persistence;
pub mod target_cache;
pub mod training;

pub use content::{ContentStore, TokenSeq};
pub use dataset::KgDataset;
pub use evaluation::{EvaluationConfig, EvaluationReport, RankingEvaluator, RelationMetrics};
pub use models::{ContentExtractor, ContentMaskConfig, ContentMaskEmbedding, Mode};
pub use persistence::{CheckpointManager, ReportExporter};
pub use target_cache::TargetCache;
pub use training::{Trainer, TrainingConfig};

/// Errors raised by embedding computation and evaluation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("Relation not found: {relation}")]
    RelationNotFound { relation: String },

    #[error("Model is not trained")]
    ModelNotTrained,

    /// Non-finite value observed in a representation, mask, or score.
    /// Always fatal: a NaN must never reach a rank computation.
    #[error("Non-finite value in {stage}")]
    NonFinite { stage: String },

    /// The target cache holds a different number of entries than the
    /// caller expects, which means scores would compare against the
    /// wrong relation's targets.
    #[error("Target cache size violation: expected {expected}, found {actual}")]
    CacheInvariant { expected: usize, actual: usize },

    /// The target cache was loaded for one relation and used with another.
    #[error("Target cache holds relation {loaded}, used with relation {requested}")]
    CacheRelationMismatch { loaded: usize, requested: usize },

    #[error("Dimension mismatch: expected {expected}, found {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// A (head, relation, tail) fact, as indexes into the dataset tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub head: usize,
    pub relation: usize,
    pub tail: usize,
}

impl Triple {
    pub fn new(head: usize, relation: usize, tail: usize) -> Self {
        Self {
            head,
            relation,
            tail,
        }
    }
}

/// Dense embedding vector exchanged over the public model API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    pub values: Vec<f32>,
    pub dimensions: usize,
}

impl Vector {
    pub fn new(values: Vec<f32>) -> Self {
        let dimensions = values.len();
        Self { values, dimensions }
    }
}

/// Base configuration shared by embedding models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding dimensionality (equals the word-embedding width)
    pub dimensions: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub max_epochs: usize,
    /// Negative tails sampled per positive triple
    pub negative_samples: usize,
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dimensions: 200,
            learning_rate: 1e-4,
            batch_size: 200,
            max_epochs: 50,
            negative_samples: 4,
            seed: None,
        }
    }
}

impl ModelConfig {
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_epochs(mut self, max_epochs: usize) -> Self {
        self.max_epochs = max_epochs;
        self
    }

    pub fn with_negative_samples(mut self, negative_samples: usize) -> Self {
        self.negative_samples = negative_samples;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Snapshot of model shape and training state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStats {
    pub num_entities: usize,
    pub num_relations: usize,
    pub num_triples: usize,
    pub dimensions: usize,
    pub is_trained: bool,
    pub model_type: String,
    pub creation_time: DateTime<Utc>,
    pub last_training_time: Option<DateTime<Utc>>,
}

/// Outcome of a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStats {
    pub epochs_completed: usize,
    pub final_loss: f64,
    pub training_time_seconds: f64,
    pub convergence_achieved: bool,
    pub loss_history: Vec<f64>,
}

/// Common interface for knowledge graph embedding models
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Model configuration
    fn config(&self) -> &ModelConfig;

    /// Unique model instance id
    fn model_id(&self) -> &Uuid;

    /// Model type name
    fn model_type(&self) -> &'static str;

    /// Register a triple for training
    fn add_triple(&mut self, triple: Triple) -> Result<()>;

    /// Train the model, optionally overriding the configured epoch count
    async fn train(&mut self, epochs: Option<usize>) -> Result<TrainingStats>;

    /// Relation-independent entity representation (title average)
    fn get_entity_embedding(&self, entity: &str) -> Result<Vector>;

    /// Relation representation (title average)
    fn get_relation_embedding(&self, relation: &str) -> Result<Vector>;

    /// Score a triple by name
    fn score_triple(&self, head: &str, relation: &str, tail: &str) -> Result<f64>;

    /// Top-k tail predictions for (head, relation)
    fn predict_objects(&self, head: &str, relation: &str, k: usize) -> Result<Vec<(String, f64)>>;

    /// All known entity names
    fn get_entities(&self) -> Vec<String>;

    /// All known relation names
    fn get_relations(&self) -> Vec<String>;

    /// Model statistics
    fn get_stats(&self) -> ModelStats;

    /// Persist trainable state to a checkpoint file
    fn save(&self, path: &str) -> Result<()>;

    /// Restore trainable state from a checkpoint file
    fn load(&mut self, path: &str) -> Result<()>;

    /// Drop all learned state and registered triples
    fn clear(&mut self);

    /// Whether the model has been trained
    fn is_trained(&self) -> bool;
}
