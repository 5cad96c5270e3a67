//! Batched training loop for the content-mask model
//!
//! Each positive triple is grouped with sampled negative tails and scored;
//! the loss is softmax cross-entropy over the group. The optimizer is
//! analytic and intentionally partial: predict weights receive their exact
//! gradient (the score is linear in them), word-embedding rows are updated
//! through the cosine normalization and the title-average path, and the
//! convolution filters keep their initialization. Checkpoints are written on
//! a step cadence and once more on clean stop.

use crate::models::conmask::SIMILARITY_CHANNELS;
use crate::models::{ContentMaskEmbedding, EntityRepr, Mode};
use crate::persistence::CheckpointManager;
use crate::{EmbeddingModel, ModelConfig, TrainingStats, Triple};
use anyhow::{anyhow, Result};
use chrono::Utc;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub max_epochs: usize,
    /// Negative tails sampled per positive triple
    pub negative_samples: usize,
    /// Checkpoint every this many optimizer steps
    pub checkpoint_every: u64,
    /// Stop after this many steps regardless of remaining epochs
    pub max_steps: Option<u64>,
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            learning_rate: 1e-4,
            max_epochs: 50,
            negative_samples: 4,
            checkpoint_every: 1000,
            max_steps: None,
            seed: None,
        }
    }
}

impl TrainingConfig {
    pub fn from_model(config: &ModelConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            max_epochs: config.max_epochs,
            negative_samples: config.negative_samples,
            seed: config.seed,
            ..Default::default()
        }
    }
}

/// Epoch-driven trainer over a model's registered triples
pub struct Trainer {
    config: TrainingConfig,
    checkpoints: Option<CheckpointManager>,
    /// Per-relation candidate pools for negative sampling. Defaults to
    /// pools derived from the registered triples.
    pools: Option<HashMap<usize, Vec<usize>>>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            checkpoints: None,
            pools: None,
        }
    }

    pub fn with_checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Sample negatives from these pools instead of pools derived from the
    /// registered triples. Dataset pools already exclude avoided entities.
    pub fn with_pools(mut self, pools: HashMap<usize, Vec<usize>>) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Run the training loop. `epochs` overrides the configured epoch count.
    pub fn train(
        &self,
        model: &mut ContentMaskEmbedding,
        epochs: Option<usize>,
    ) -> Result<TrainingStats> {
        let epochs = epochs.unwrap_or(self.config.max_epochs);
        let triples = model.base.triples.clone();
        if triples.is_empty() {
            return Err(anyhow!("no training triples registered"));
        }

        let pools = match &self.pools {
            Some(pools) => pools.clone(),
            None => derive_pools(&triples),
        };
        let mut rng = match self.config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        info!(
            "training on {} triples for up to {} epochs, batch size {}",
            triples.len(),
            epochs,
            self.config.batch_size
        );

        let start = Instant::now();
        let mut loss_history = Vec::with_capacity(epochs);
        let mut stopped = false;

        'epochs: for epoch in 0..epochs {
            let mut order = triples.clone();
            order.shuffle(&mut rng);

            let mut epoch_loss = 0.0;
            let mut batches = 0usize;
            for batch in order.chunks(self.config.batch_size.max(1)) {
                let mut batch_loss = 0.0;
                for &triple in batch {
                    batch_loss += self.step(model, &pools, triple, &mut rng)?;
                }
                epoch_loss += batch_loss / batch.len() as f64;
                batches += 1;
                model.base.global_step += 1;

                if let Some(manager) = &self.checkpoints {
                    if model.base.global_step % self.config.checkpoint_every.max(1) == 0 {
                        manager.save_checkpoint(model, model.base.global_step)?;
                    }
                }
                if let Some(max) = self.config.max_steps {
                    if model.base.global_step >= max {
                        debug!("reached step limit {} mid-epoch, stopping", max);
                        loss_history.push(epoch_loss / batches as f64);
                        stopped = true;
                        break 'epochs;
                    }
                }
            }

            let mean_loss = epoch_loss / batches as f64;
            loss_history.push(mean_loss);
            debug!("epoch {}: mean loss {:.6}", epoch + 1, mean_loss);
        }

        model.base.is_trained = true;
        model.base.last_training_time = Some(Utc::now());

        // Clean stop, including end of data, flushes a final checkpoint
        if let Some(manager) = &self.checkpoints {
            manager.save_checkpoint(model, model.base.global_step)?;
        }

        let final_loss = loss_history.last().copied().unwrap_or(0.0);
        let convergence_achieved = !stopped
            && loss_history.len() >= 2
            && (loss_history[loss_history.len() - 2] - final_loss).abs() < 1e-6;
        info!(
            "training finished: {} epochs, final loss {:.6}, step {}",
            loss_history.len(),
            final_loss,
            model.base.global_step
        );

        Ok(TrainingStats {
            epochs_completed: loss_history.len(),
            final_loss,
            training_time_seconds: start.elapsed().as_secs_f64(),
            convergence_achieved,
            loss_history,
        })
    }

    /// One positive triple: sample negatives, score the group, update the
    /// predict weights and the title-token embedding rows. Returns the loss.
    fn step(
        &self,
        model: &mut ContentMaskEmbedding,
        pools: &HashMap<usize, Vec<usize>>,
        triple: Triple,
        rng: &mut StdRng,
    ) -> Result<f64> {
        let rel_vec = model.transform_relation(triple.relation)?;
        let head = model.transform_entity(triple.head, &rel_vec, Mode::Train)?;

        let mut candidates = vec![triple.tail];
        candidates.extend(self.sample_negatives(model, pools, triple, rng));

        let reprs: Vec<EntityRepr> = candidates
            .iter()
            .map(|&t| model.transform_entity(t, &rel_vec, Mode::Train))
            .collect::<Result<_>>()?;
        let sims: Vec<[f32; SIMILARITY_CHANNELS]> =
            reprs.iter().map(|r| model.similarities(&head, r)).collect();
        let scores: Vec<f64> = sims
            .iter()
            .map(|s| {
                s.iter()
                    .zip(model.predict_weight.iter())
                    .map(|(sim, w)| (sim * w) as f64)
                    .sum()
            })
            .collect();

        // Stable softmax cross-entropy with the true tail at index 0
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let z: f64 = exps.iter().sum();
        let loss = z.ln() + max - scores[0];

        // coeff_j = p_j - y_j, the group softmax gradient
        let coeffs: Vec<f32> = exps
            .iter()
            .enumerate()
            .map(|(j, e)| ((e / z) as f32) - if j == 0 { 1.0 } else { 0.0 })
            .collect();

        let lr = self.config.learning_rate as f32;
        let weights = *model.predict_weight();

        // Exact gradient for the predict weights
        for i in 0..SIMILARITY_CHANNELS {
            let grad: f32 = coeffs.iter().zip(&sims).map(|(c, s)| c * s[i]).sum();
            model.predict_weight[i] -= lr * grad;
        }

        // Title-path gradients through the cosine normalization. Channel
        // order: hc*tc, hc*tt, tc*ht, ht*tt; only the title channels reach
        // the embedding table here.
        let (ht_hat, ht_norm) = unit_and_norm(&head.title);
        let mut ht_grad = Array1::<f32>::zeros(head.title.len());
        let mut row_updates: HashMap<usize, Array1<f32>> = HashMap::new();

        for (j, (repr, sim)) in reprs.iter().zip(&sims).enumerate() {
            let coeff = coeffs[j];
            let (hc_hat, _) = unit_and_norm(&head.content);
            let (tc_hat, _) = unit_and_norm(&repr.content);
            let (tt_hat, tt_norm) = unit_and_norm(&repr.title);

            if ht_norm > 0.0 {
                ht_grad = ht_grad
                    + (&tc_hat - &(&ht_hat * sim[2])) * (coeff * weights[2] / ht_norm)
                    + (&tt_hat - &(&ht_hat * sim[3])) * (coeff * weights[3] / ht_norm);
            }
            if tt_norm > 0.0 {
                let tt_grad = (&hc_hat - &(&tt_hat * sim[1])) * (coeff * weights[1] / tt_norm)
                    + (&ht_hat - &(&tt_hat * sim[3])) * (coeff * weights[3] / tt_norm);
                accumulate_title_rows(model, candidates[j], &tt_grad, &mut row_updates)?;
            }
        }
        accumulate_title_rows(model, triple.head, &ht_grad, &mut row_updates)?;

        let table = model.store.embeddings_mut();
        for (row, grad) in row_updates {
            let mut target = table.row_mut(row);
            target.zip_mut_with(&grad, |v, g| *v -= lr * g);
        }

        Ok(loss)
    }

    /// Sample distinct negative tails from the relation's candidate pool,
    /// rejecting known-true tails; fall back to uniform over all entities
    /// when the pool cannot supply enough.
    fn sample_negatives(
        &self,
        model: &ContentMaskEmbedding,
        pools: &HashMap<usize, Vec<usize>>,
        triple: Triple,
        rng: &mut StdRng,
    ) -> Vec<usize> {
        let wanted = self.config.negative_samples;
        let num_entities = model.store().num_entities();
        let pool = pools.get(&triple.relation).filter(|p| p.len() > 1);

        let mut negatives = Vec::with_capacity(wanted);
        let mut attempts = 0usize;
        let budget = wanted.saturating_mul(20).max(20);
        while negatives.len() < wanted && attempts < budget {
            attempts += 1;
            let candidate = match pool {
                // Pooled sampling first, uniform fallback afterwards
                Some(pool) if attempts <= budget / 2 => pool[rng.gen_range(0..pool.len())],
                _ => rng.gen_range(0..num_entities),
            };
            if candidate == triple.tail
                || model.base.is_positive(triple.head, triple.relation, candidate)
                || negatives.contains(&candidate)
            {
                continue;
            }
            negatives.push(candidate);
        }
        negatives
    }
}

/// Trait-surface training: the model's registered triples, no checkpoints
pub fn run_basic_training(
    model: &mut ContentMaskEmbedding,
    epochs: Option<usize>,
) -> Result<TrainingStats> {
    Trainer::new(TrainingConfig::from_model(model.config())).train(model, epochs)
}

fn derive_pools(triples: &[Triple]) -> HashMap<usize, Vec<usize>> {
    let mut pools: HashMap<usize, Vec<usize>> = HashMap::new();
    for t in triples {
        let pool = pools.entry(t.relation).or_default();
        if !pool.contains(&t.tail) {
            pool.push(t.tail);
        }
    }
    pools
}

fn unit_and_norm(v: &Array1<f32>) -> (Array1<f32>, f32) {
    let norm = v.dot(v).sqrt();
    if norm > 0.0 {
        (v / norm, norm)
    } else {
        (v.clone(), 0.0)
    }
}

/// Spread a title-vector gradient evenly over the entity's title-token
/// rows (the mean path). The PAD row never receives updates.
fn accumulate_title_rows(
    model: &ContentMaskEmbedding,
    entity: usize,
    grad: &Array1<f32>,
    row_updates: &mut HashMap<usize, Array1<f32>>,
) -> Result<()> {
    let title = model.store().entity_title(entity)?;
    let len = title.len();
    if len == 0 {
        return Ok(());
    }
    let share = grad / len as f32;
    for &token in &title.tokens()[..len] {
        if token == crate::content::PAD_WORD {
            continue;
        }
        row_updates
            .entry(token)
            .and_modify(|acc| *acc += &share)
            .or_insert_with(|| share.clone());
    }
    Ok(())
}
