//! Content-mask embedding model
//!
//! Scores (head, relation, tail) triples from entity text. The relation's
//! title average gates the head/tail descriptions, a convolutional stack
//! collapses each gated description into a content vector, titles are
//! averaged into a second vector, and four cosine similarities between the
//! head and tail pairs combine under a learned weight per channel. One
//! stateless transformer serves both roles: the head/tail asymmetry is only
//! in which ids are passed, never in the weights.

use crate::content::ContentStore;
use crate::models::base::BaseModel;
use crate::models::extractor::{avg_content, mask_content, ContentExtractor, ConvFilter, Mode};
use crate::{
    EmbeddingError, EmbeddingModel, ModelConfig, ModelStats, TrainingStats, Triple, Vector,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{debug, warn};
use uuid::Uuid;

/// Number of similarity channels combined by the predictor
pub const SIMILARITY_CHANNELS: usize = 4;

/// Configuration for the content-mask model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentMaskConfig {
    pub base_config: ModelConfig,
    /// Description width in tokens; longer descriptions are truncated
    pub max_content_len: usize,
    /// Title width in tokens
    pub max_title_len: usize,
    pub conv_layers: usize,
    pub convs_per_layer: usize,
    pub window_size: usize,
    /// Dropout keep probability applied at train time
    pub keep_prob: f32,
}

impl Default for ContentMaskConfig {
    fn default() -> Self {
        Self {
            base_config: ModelConfig::default(),
            max_content_len: 256,
            max_title_len: 16,
            conv_layers: 3,
            convs_per_layer: 2,
            window_size: 3,
            keep_prob: 0.85,
        }
    }
}

/// Per-entity representation pair. Content is relation-conditioned, the
/// title average is not.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRepr {
    pub content: Array1<f32>,
    pub title: Array1<f32>,
}

/// Content-based embedding model over descriptions and titles
pub struct ContentMaskEmbedding {
    pub(crate) base: BaseModel,
    pub(crate) store: ContentStore,
    pub(crate) extractor: ContentExtractor,
    pub(crate) predict_weight: [f32; SIMILARITY_CHANNELS],
    config: ContentMaskConfig,
}

impl ContentMaskEmbedding {
    /// Build a model over a loaded content store and fixed name tables
    pub fn new(
        config: ContentMaskConfig,
        store: ContentStore,
        entity_names: Vec<String>,
        relation_names: Vec<String>,
    ) -> Result<Self> {
        if store.dim() != config.base_config.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: config.base_config.dimensions,
                actual: store.dim(),
            }
            .into());
        }
        if store.num_entities() != entity_names.len() {
            return Err(anyhow!(
                "content store covers {} entities, name table has {}",
                store.num_entities(),
                entity_names.len()
            ));
        }
        if store.num_relations() != relation_names.len() {
            return Err(anyhow!(
                "content store covers {} relations, name table has {}",
                store.num_relations(),
                relation_names.len()
            ));
        }

        let extractor = ContentExtractor::new(
            store.dim(),
            config.conv_layers,
            config.convs_per_layer,
            config.window_size,
            config.keep_prob,
            config.base_config.seed,
        );
        let mut base = BaseModel::new(config.base_config.clone());
        base.set_vocabulary(entity_names, relation_names);

        Ok(Self {
            base,
            store,
            extractor,
            predict_weight: [1.0; SIMILARITY_CHANNELS],
            config,
        })
    }

    /// Convenience constructor that also registers the dataset's train
    /// triples
    pub fn from_dataset(
        config: ContentMaskConfig,
        store: ContentStore,
        dataset: &crate::dataset::KgDataset,
    ) -> Result<Self> {
        let mut model = Self::new(
            config,
            store,
            dataset.entity_names.clone(),
            dataset.relation_names.clone(),
        )?;
        for triple in &dataset.train_triples {
            model.add_triple(*triple)?;
        }
        Ok(model)
    }

    pub fn content_config(&self) -> &ContentMaskConfig {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn predict_weight(&self) -> &[f32; SIMILARITY_CHANNELS] {
        &self.predict_weight
    }

    pub fn global_step(&self) -> u64 {
        self.base.global_step
    }

    /// Relation representation: the average of its title-token embeddings,
    /// falling back to the PAD vector for an empty title
    pub fn transform_relation(&self, relation: usize) -> Result<Array1<f32>> {
        let title = self.store.relation_title(relation)?;
        let rows = self.store.embed_sequence(title);
        let pad = self.store.pad_vector();
        avg_content(rows.view(), title.len(), pad.view(), "relation title average")
    }

    /// Entity representation for one role under one relation.
    ///
    /// The description is gated by the relation vector and collapsed by the
    /// convolutional extractor; the title is averaged. Both outputs are
    /// finiteness-checked, so a NaN can never reach a score.
    pub fn transform_entity(
        &self,
        entity: usize,
        relation_vec: &Array1<f32>,
        mode: Mode,
    ) -> Result<EntityRepr> {
        let pad = self.store.pad_vector();

        let description = self.store.description(entity)?;
        let desc_rows = self.store.embed_sequence(description);
        let masked = mask_content(desc_rows.view(), relation_vec.view(), "relation mask")?;
        let content = self
            .extractor
            .extract(&masked, description.len(), pad.view(), mode)?;

        let title = self.store.entity_title(entity)?;
        let title_rows = self.store.embed_sequence(title);
        let title = avg_content(title_rows.view(), title.len(), pad.view(), "title average")?;

        Ok(EntityRepr { content, title })
    }

    /// Precompute representations for a batch of target entities.
    /// Evaluation-time fan-out; always runs in eval mode.
    pub fn transform_targets(
        &self,
        relation_vec: &Array1<f32>,
        targets: &[usize],
    ) -> Result<Vec<EntityRepr>> {
        targets
            .par_iter()
            .map(|&t| self.transform_entity(t, relation_vec, Mode::Eval))
            .collect()
    }

    /// The four similarity channels between a head and tail pair:
    /// content-content, head content vs tail title, tail content vs head
    /// title, title-title. Inputs are unit-normalized independently.
    pub fn similarities(&self, head: &EntityRepr, tail: &EntityRepr) -> [f32; SIMILARITY_CHANNELS] {
        let hc = normalize(&head.content);
        let ht = normalize(&head.title);
        let tc = normalize(&tail.content);
        let tt = normalize(&tail.title);
        [hc.dot(&tc), hc.dot(&tt), tc.dot(&ht), ht.dot(&tt)]
    }

    /// Weighted similarity score. Non-finite output is a fatal error.
    pub fn score_pair(&self, head: &EntityRepr, tail: &EntityRepr) -> Result<f64> {
        let sims = self.similarities(head, tail);
        let score: f32 = sims
            .iter()
            .zip(self.predict_weight.iter())
            .map(|(s, w)| s * w)
            .sum();
        if !score.is_finite() {
            return Err(EmbeddingError::NonFinite {
                stage: "predictor".to_string(),
            }
            .into());
        }
        Ok(score as f64)
    }

    /// Score one head against a precomputed target batch
    pub fn score_against(&self, head: &EntityRepr, targets: &[EntityRepr]) -> Result<Vec<f32>> {
        targets
            .par_iter()
            .map(|t| self.score_pair(head, t).map(|s| s as f32))
            .collect()
    }

    /// Score a triple by ids
    pub fn score_ids(&self, head: usize, relation: usize, tail: usize) -> Result<f64> {
        let rel_vec = self.transform_relation(relation)?;
        let head_repr = self.transform_entity(head, &rel_vec, Mode::Eval)?;
        let tail_repr = self.transform_entity(tail, &rel_vec, Mode::Eval)?;
        self.score_pair(&head_repr, &tail_repr)
    }

    fn require_entity(&self, name: &str) -> Result<usize> {
        self.base.entity_id(name).ok_or_else(|| {
            EmbeddingError::EntityNotFound {
                entity: name.to_string(),
            }
            .into()
        })
    }

    fn require_relation(&self, name: &str) -> Result<usize> {
        self.base.relation_id(name).ok_or_else(|| {
            EmbeddingError::RelationNotFound {
                relation: name.to_string(),
            }
            .into()
        })
    }
}

/// Unit-normalize, leaving the zero vector untouched
fn normalize(v: &Array1<f32>) -> Array1<f32> {
    let norm = v.dot(v).sqrt();
    if norm > 0.0 {
        v / norm
    } else {
        v.clone()
    }
}

/// Serialized trainable state. Field names are the checkpoint schema;
/// restore tolerates missing fields by keeping fresh initialization.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CheckpointState {
    pub version: u32,
    pub global_step: u64,
    pub dimensions: usize,
    pub predict_weight: Vec<f32>,
    pub word_embeddings: Array2<f32>,
    pub conv_layers: Vec<Vec<ConvFilter>>,
}

impl ContentMaskEmbedding {
    fn capture_state(&self) -> CheckpointState {
        CheckpointState {
            version: 1,
            global_step: self.base.global_step,
            dimensions: self.store.dim(),
            predict_weight: self.predict_weight.to_vec(),
            word_embeddings: self.store.embeddings().clone(),
            conv_layers: self.extractor.layers().to_vec(),
        }
    }

    fn apply_state(&mut self, state: CheckpointState) {
        self.base.global_step = state.global_step;

        if state.dimensions != self.store.dim() {
            warn!(
                "checkpoint dimensions {} differ from model {}, keeping fresh embeddings and filters",
                state.dimensions,
                self.store.dim()
            );
            return;
        }

        if state.predict_weight.len() == SIMILARITY_CHANNELS {
            for (dst, src) in self.predict_weight.iter_mut().zip(&state.predict_weight) {
                *dst = *src;
            }
        } else {
            warn!(
                "checkpoint predict_weight has {} channels, expected {}, keeping fresh initialization",
                state.predict_weight.len(),
                SIMILARITY_CHANNELS
            );
        }

        match self.store.set_embeddings(state.word_embeddings) {
            Ok(()) => {}
            Err(e) => warn!("checkpoint word embeddings rejected: {e}, keeping fresh table"),
        }

        let layers_ok = state.conv_layers.len() == self.config.conv_layers
            && state
                .conv_layers
                .iter()
                .all(|layer| layer.len() == self.config.convs_per_layer);
        if layers_ok {
            self.extractor.set_layers(state.conv_layers);
        } else {
            warn!("checkpoint convolution stack shape differs, keeping fresh filters");
        }

        self.base.is_trained = true;
    }

    /// Restore whatever fields a loosely-shaped checkpoint carries, warning
    /// for each missing variable group. Used when the typed parse fails.
    fn apply_partial(&mut self, value: serde_json::Value) {
        match value.get("global_step").and_then(|v| v.as_u64()) {
            Some(step) => self.base.global_step = step,
            None => warn!("checkpoint missing global_step, starting from 0"),
        }

        match value
            .get("predict_weight")
            .cloned()
            .and_then(|v| serde_json::from_value::<Vec<f32>>(v).ok())
        {
            Some(w) if w.len() == SIMILARITY_CHANNELS => {
                for (dst, src) in self.predict_weight.iter_mut().zip(&w) {
                    *dst = *src;
                }
            }
            _ => warn!("checkpoint missing predict_weight, keeping fresh initialization"),
        }

        match value
            .get("word_embeddings")
            .cloned()
            .and_then(|v| serde_json::from_value::<Array2<f32>>(v).ok())
        {
            Some(table) => {
                if let Err(e) = self.store.set_embeddings(table) {
                    warn!("checkpoint word embeddings rejected: {e}, keeping fresh table");
                }
            }
            None => warn!("checkpoint missing word_embeddings, keeping fresh table"),
        }

        match value
            .get("conv_layers")
            .cloned()
            .and_then(|v| serde_json::from_value::<Vec<Vec<ConvFilter>>>(v).ok())
        {
            Some(layers)
                if layers.len() == self.config.conv_layers
                    && layers
                        .iter()
                        .all(|l| l.len() == self.config.convs_per_layer) =>
            {
                self.extractor.set_layers(layers);
            }
            _ => warn!("checkpoint missing convolution filters, keeping fresh initialization"),
        }
    }
}

#[async_trait]
impl EmbeddingModel for ContentMaskEmbedding {
    fn config(&self) -> &ModelConfig {
        &self.base.config
    }

    fn model_id(&self) -> &Uuid {
        &self.base.model_id
    }

    fn model_type(&self) -> &'static str {
        "ContentMaskEmbedding"
    }

    fn add_triple(&mut self, triple: Triple) -> Result<()> {
        self.base.add_triple(triple)
    }

    async fn train(&mut self, epochs: Option<usize>) -> Result<TrainingStats> {
        crate::training::run_basic_training(self, epochs)
    }

    /// Relation-independent entity representation: the title average
    fn get_entity_embedding(&self, entity: &str) -> Result<Vector> {
        let id = self.require_entity(entity)?;
        let title = self.store.entity_title(id)?;
        let rows = self.store.embed_sequence(title);
        let pad = self.store.pad_vector();
        let avg = avg_content(rows.view(), title.len(), pad.view(), "title average")?;
        Ok(Vector::new(avg.to_vec()))
    }

    fn get_relation_embedding(&self, relation: &str) -> Result<Vector> {
        let id = self.require_relation(relation)?;
        let vec = self.transform_relation(id)?;
        Ok(Vector::new(vec.to_vec()))
    }

    fn score_triple(&self, head: &str, relation: &str, tail: &str) -> Result<f64> {
        let h = self.require_entity(head)?;
        let r = self.require_relation(relation)?;
        let t = self.require_entity(tail)?;
        self.score_ids(h, r, t)
    }

    fn predict_objects(&self, head: &str, relation: &str, k: usize) -> Result<Vec<(String, f64)>> {
        let h = self.require_entity(head)?;
        let r = self.require_relation(relation)?;

        let rel_vec = self.transform_relation(r)?;
        let head_repr = self.transform_entity(h, &rel_vec, Mode::Eval)?;

        let mut scored: Vec<(String, f64)> = (0..self.base.num_entities())
            .into_par_iter()
            .map(|t| {
                let repr = self.transform_entity(t, &rel_vec, Mode::Eval)?;
                let score = self.score_pair(&head_repr, &repr)?;
                Ok((self.base.entity_names[t].clone(), score))
            })
            .collect::<Result<_>>()?;

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn get_entities(&self) -> Vec<String> {
        self.base.entity_names.clone()
    }

    fn get_relations(&self) -> Vec<String> {
        self.base.relation_names.clone()
    }

    fn get_stats(&self) -> ModelStats {
        ModelStats {
            num_entities: self.base.num_entities(),
            num_relations: self.base.num_relations(),
            num_triples: self.base.triples.len(),
            dimensions: self.store.dim(),
            is_trained: self.base.is_trained,
            model_type: self.model_type().to_string(),
            creation_time: self.base.creation_time,
            last_training_time: self.base.last_training_time,
        }
    }

    fn save(&self, path: &str) -> Result<()> {
        let state = self.capture_state();
        let file = fs::File::create(path).with_context(|| format!("creating {path}"))?;
        serde_json::to_writer(std::io::BufWriter::new(file), &state)
            .with_context(|| format!("writing checkpoint {path}"))?;
        debug!("saved checkpoint to {path} at step {}", state.global_step);
        Ok(())
    }

    fn load(&mut self, path: &str) -> Result<()> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        match serde_json::from_str::<CheckpointState>(&raw) {
            Ok(state) => {
                self.apply_state(state);
            }
            Err(e) => {
                warn!("checkpoint {path} does not match the model schema ({e}), attempting partial restore");
                let value: serde_json::Value = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing checkpoint {path}"))?;
                self.apply_partial(value);
            }
        }
        Ok(())
    }

    /// Drop learned state and registered triples. The content store keeps
    /// its tables; they are dataset inputs, not learned state.
    fn clear(&mut self) {
        self.base.clear();
        self.predict_weight = [1.0; SIMILARITY_CHANNELS];
        self.extractor = ContentExtractor::new(
            self.store.dim(),
            self.config.conv_layers,
            self.config.convs_per_layer,
            self.config.window_size,
            self.config.keep_prob,
            self.config.base_config.seed,
        );
    }

    fn is_trained(&self) -> bool {
        self.base.is_trained
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::content::TokenSeq;
    use ndarray::arr2;

    /// Four entities, two relations, dim-4 embeddings. Entity 3 has an
    /// empty description and title.
    pub(crate) fn tiny_model() -> ContentMaskEmbedding {
        let vocab = vec![
            "<pad>".to_string(),
            "red".to_string(),
            "green".to_string(),
            "blue".to_string(),
            "lake".to_string(),
            "hill".to_string(),
        ];
        let embeddings = arr2(&[
            [0.0, 0.0, 0.0, 0.0],
            [0.9, 0.1, 0.0, 0.2],
            [0.1, 0.8, 0.1, 0.0],
            [0.0, 0.2, 0.9, 0.1],
            [0.3, 0.3, 0.1, 0.7],
            [0.2, 0.0, 0.4, 0.6],
        ]);
        let descriptions = vec![
            TokenSeq::new(vec![1, 2, 4], 6),
            TokenSeq::new(vec![2, 3], 6),
            TokenSeq::new(vec![4, 5, 1, 3], 6),
            TokenSeq::empty(6),
        ];
        let titles = vec![
            TokenSeq::new(vec![1], 3),
            TokenSeq::new(vec![2, 3], 3),
            TokenSeq::new(vec![4], 3),
            TokenSeq::empty(3),
        ];
        let relation_titles = vec![TokenSeq::new(vec![4, 5], 3), TokenSeq::new(vec![3], 3)];
        let store = ContentStore::new(vocab, embeddings, descriptions, titles, relation_titles)
            .unwrap();

        let config = ContentMaskConfig {
            base_config: ModelConfig::default().with_dimensions(4).with_seed(17),
            max_content_len: 6,
            max_title_len: 3,
            ..Default::default()
        };
        ContentMaskEmbedding::new(
            config,
            store,
            vec!["e0".into(), "e1".into(), "e2".into(), "e3".into()],
            vec!["near".into(), "colored".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_relation_transform_is_title_average() {
        let model = tiny_model();
        let rel = model.transform_relation(0).unwrap();
        // Mean of rows 4 and 5
        let expected = [0.25, 0.15, 0.25, 0.65];
        for (a, b) in rel.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_empty_entity_falls_back_to_pad() {
        let model = tiny_model();
        let rel_vec = model.transform_relation(0).unwrap();
        let repr = model.transform_entity(3, &rel_vec, Mode::Eval).unwrap();
        let pad = model.store.pad_vector();
        assert_eq!(repr.content, pad);
        assert_eq!(repr.title, pad);
    }

    #[test]
    fn test_score_swap_symmetry_with_equal_cross_weights() {
        let model = tiny_model();
        let rel_vec = model.transform_relation(0).unwrap();
        let a = model.transform_entity(0, &rel_vec, Mode::Eval).unwrap();
        let b = model.transform_entity(1, &rel_vec, Mode::Eval).unwrap();

        // Default weights are all 1.0, so both cross channels match
        let forward = model.score_pair(&a, &b).unwrap();
        let backward = model.score_pair(&b, &a).unwrap();
        assert!((forward - backward).abs() < 1e-6);
    }

    #[test]
    fn test_unequal_cross_weights_break_symmetry() {
        let mut model = tiny_model();
        model.predict_weight = [1.0, 2.0, 0.5, 1.0];
        let rel_vec = model.transform_relation(0).unwrap();
        let a = model.transform_entity(0, &rel_vec, Mode::Eval).unwrap();
        let b = model.transform_entity(1, &rel_vec, Mode::Eval).unwrap();

        let sims_ab = model.similarities(&a, &b);
        let forward = model.score_pair(&a, &b).unwrap();
        let backward = model.score_pair(&b, &a).unwrap();
        // The fixture has distinct cross similarities, so unequal weights
        // must produce distinct scores
        assert!((sims_ab[1] - sims_ab[2]).abs() > 1e-6);
        assert!((forward - backward).abs() > 1e-9);
    }

    #[test]
    fn test_score_triple_by_name() {
        let model = tiny_model();
        let score = model.score_triple("e0", "near", "e2").unwrap();
        assert!(score.is_finite());

        let err = model.score_triple("e0", "near", "nope").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_predict_objects_sorted_and_truncated() {
        let model = tiny_model();
        let top = model.predict_objects("e0", "near", 2).unwrap();
        assert_eq!(top.len(), 2);
        assert!(top[0].1 >= top[1].1);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ckpt.json");
        let path = path.to_str().unwrap();

        let mut model = tiny_model();
        model.predict_weight = [0.5, 1.5, -0.5, 2.0];
        model.base.global_step = 123;
        model.save(path).unwrap();

        let mut restored = tiny_model();
        restored.load(path).unwrap();
        assert_eq!(restored.predict_weight, [0.5, 1.5, -0.5, 2.0]);
        assert_eq!(restored.global_step(), 123);
        assert_eq!(restored.store.embeddings(), model.store.embeddings());
        assert!(restored.is_trained());

        // Restored filters produce identical representations
        let rel_vec = restored.transform_relation(1).unwrap();
        let a = model
            .transform_entity(2, &model.transform_relation(1).unwrap(), Mode::Eval)
            .unwrap();
        let b = restored.transform_entity(2, &rel_vec, Mode::Eval).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_partial_checkpoint_keeps_fresh_values() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("old.json");
        std::fs::write(&path, r#"{"version":1,"global_step":55}"#).unwrap();

        let mut model = tiny_model();
        model.load(path.to_str().unwrap()).unwrap();
        assert_eq!(model.global_step(), 55);
        // Missing variable groups keep their fresh initialization
        assert_eq!(model.predict_weight, [1.0; SIMILARITY_CHANNELS]);
    }

    #[tokio::test]
    async fn test_train_marks_model_trained() {
        let mut model = tiny_model();
        model.add_triple(Triple::new(0, 0, 2)).unwrap();
        model.add_triple(Triple::new(1, 0, 2)).unwrap();
        model.add_triple(Triple::new(0, 1, 1)).unwrap();

        let stats = model.train(Some(2)).await.unwrap();
        assert!(model.is_trained());
        assert_eq!(stats.epochs_completed, 2);
        assert!(stats.final_loss.is_finite());
        assert_eq!(stats.loss_history.len(), 2);
    }
}
