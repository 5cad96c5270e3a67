//! Filtered-rank evaluation over per-relation candidate pools
//!
//! For each relation in the test set, the evaluator precomputes the
//! relation's candidate pool into the [`TargetCache`], scores every
//! (head, relation) query against the cached pool, derives filtered ranks
//! for the query's true tails, and drains the cache before moving on. Ranks
//! are also computed over uniform-random scores as a sanity baseline. The
//! output is one metrics row per relation plus a pooled OVERALL row.

use crate::dataset::KgDataset;
use crate::models::{ContentMaskEmbedding, Mode};
use crate::target_cache::TargetCache;
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Targets transformed per precompute chunk
pub const EVAL_CHUNK: usize = 500;

/// Name of the pooled summary row
pub const OVERALL_ROW: &str = "OVERALL";

/// Column order of the metrics report
pub const REPORT_COLUMNS: [&str; 10] = [
    "relationship",
    "mean_rank",
    "mrr",
    "mrr_per_triple",
    "rand_mean_rank",
    "rand_mrr",
    "rand_mrr_per_triple",
    "miss",
    "triples",
    "targets",
];

#[derive(Debug, Clone)]
pub struct EvaluationConfig {
    /// Targets transformed per cache-load chunk
    pub chunk_size: usize,
    /// Seed for the random-score baseline
    pub seed: Option<u64>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            chunk_size: EVAL_CHUNK,
            seed: None,
        }
    }
}

/// One row of the metrics report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationMetrics {
    pub relationship: String,
    pub mean_rank: f64,
    pub mrr: f64,
    pub mrr_per_triple: f64,
    pub rand_mean_rank: f64,
    pub rand_mrr: f64,
    pub rand_mrr_per_triple: f64,
    /// True targets absent from the candidate pool; reported, never ranked
    /// and never folded into `triples`
    pub miss: usize,
    /// Ranked (query, true-target) pairs
    pub triples: usize,
    /// Candidate pool size; -1 on the OVERALL row
    pub targets: i64,
}

/// Per-relation rows plus the pooled OVERALL row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub rows: Vec<RelationMetrics>,
    pub overall: RelationMetrics,
}

/// Filtered 1-based ranks for the evaluated true targets.
///
/// `scores[i]` is the model score of pool candidate `i`. The rank of an
/// evaluated target is 1 plus the number of strictly-higher-scoring
/// candidates that are not themselves known-true: other true answers never
/// occupy rank positions ahead of the target being scored.
pub fn filtered_ranks(scores: &[f32], filter: &HashSet<usize>, eval: &[usize]) -> Vec<usize> {
    eval.iter()
        .map(|&target| {
            let own = scores[target];
            let ahead = scores
                .iter()
                .enumerate()
                .filter(|&(i, &s)| s > own && !filter.contains(&i))
                .count();
            1 + ahead
        })
        .collect()
}

/// Rank and reciprocal-rank sums pooled over queries and their
/// (query, true-target) pairs
#[derive(Debug, Default, Clone)]
struct RankAccum {
    rank_sum: f64,
    /// One reciprocal-rank value per query: the mean of 1/rank over the
    /// query's evaluated targets
    rr_query_sum: f64,
    /// Each pair contributes its query's best reciprocal rank
    best_rr_sum: f64,
    pairs: usize,
    queries: usize,
}

impl RankAccum {
    fn add_query(&mut self, ranks: &[usize]) {
        if ranks.is_empty() {
            return;
        }
        let best = ranks.iter().copied().min().unwrap_or(usize::MAX);
        let best_rr = 1.0 / best as f64;
        let mut rr_sum = 0.0;
        for &rank in ranks {
            self.rank_sum += rank as f64;
            rr_sum += 1.0 / rank as f64;
            self.best_rr_sum += best_rr;
        }
        self.rr_query_sum += rr_sum / ranks.len() as f64;
        self.pairs += ranks.len();
        self.queries += 1;
    }

    fn merge(&mut self, other: &RankAccum) {
        self.rank_sum += other.rank_sum;
        self.rr_query_sum += other.rr_query_sum;
        self.best_rr_sum += other.best_rr_sum;
        self.pairs += other.pairs;
        self.queries += other.queries;
    }

    fn mean_rank(&self) -> f64 {
        if self.pairs == 0 {
            0.0
        } else {
            self.rank_sum / self.pairs as f64
        }
    }

    /// Mean over queries, not pairs: a query with many true targets
    /// contributes one value
    fn mrr(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.rr_query_sum / self.queries as f64
        }
    }

    fn mrr_per_triple(&self) -> f64 {
        if self.pairs == 0 {
            0.0
        } else {
            self.best_rr_sum / self.pairs as f64
        }
    }
}

/// Everything one relation contributes to the report
#[derive(Debug, Clone)]
struct RelationAccum {
    model: RankAccum,
    random: RankAccum,
    miss: usize,
    targets: usize,
}

/// Sequential evaluator over one model, one dataset, one target cache
pub struct RankingEvaluator<'a> {
    model: &'a ContentMaskEmbedding,
    dataset: &'a KgDataset,
    config: EvaluationConfig,
    cache: TargetCache,
    rng: StdRng,
}

impl<'a> RankingEvaluator<'a> {
    pub fn new(model: &'a ContentMaskEmbedding, dataset: &'a KgDataset) -> Self {
        Self::with_config(model, dataset, EvaluationConfig::default())
    }

    pub fn with_config(
        model: &'a ContentMaskEmbedding,
        dataset: &'a KgDataset,
        config: EvaluationConfig,
    ) -> Self {
        let rng = match config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            model,
            dataset,
            config,
            cache: TargetCache::new(),
            rng,
        }
    }

    /// Entries currently cached; exposed for invariant checks
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Precompute the relation's target representations into the cache.
    ///
    /// Targets are transformed in chunks of `config.chunk_size`. After the
    /// last chunk the cache must have grown by exactly `targets.len()`.
    pub fn precompute(&mut self, relation: usize, targets: &[usize]) -> Result<()> {
        let before = self.cache.len();
        let rel_vec = self.model.transform_relation(relation)?;
        for chunk in targets.chunks(self.config.chunk_size.max(1)) {
            let reprs = self.model.transform_targets(&rel_vec, chunk)?;
            self.cache.load(relation, reprs)?;
        }
        self.cache.verify(relation, before + targets.len())
    }

    /// Score one head against every cached target. The cache size is
    /// unchanged by this call.
    pub fn score_query(&self, head: usize, relation: usize) -> Result<Vec<f32>> {
        self.cache.verify(relation, self.cache.len())?;
        let rel_vec = self.model.transform_relation(relation)?;
        let head_repr = self.model.transform_entity(head, &rel_vec, Mode::Eval)?;
        self.model.score_against(&head_repr, self.cache.peek_all())
    }

    /// Drop the cached pool; `expected` must match the cache size exactly
    pub fn drain(&mut self, expected: usize) -> Result<()> {
        self.cache.clear(expected)
    }

    /// Evaluate one relation's test queries. Returns None when the relation
    /// has no known candidate pool.
    pub fn evaluate_relation(&mut self, relation: usize) -> Result<Option<RelationMetrics>> {
        let name = self
            .dataset
            .relation_names
            .get(relation)
            .cloned()
            .unwrap_or_else(|| relation.to_string());
        match self.relation_accum(relation)? {
            Some(accum) => {
                let metrics = metrics_row(&name, &accum);
                info!(
                    "relation {}: mean_rank {:.2}, mrr {:.4}, {} pairs, {} misses, {} targets",
                    name, metrics.mean_rank, metrics.mrr, accum.model.pairs, accum.miss, accum.targets
                );
                Ok(Some(metrics))
            }
            None => Ok(None),
        }
    }

    /// Evaluate every relation present in the test triples and pool the
    /// per-pair values into the OVERALL row.
    pub fn evaluate_all(&mut self) -> Result<EvaluationReport> {
        let mut rows = Vec::new();
        let mut overall = RelationAccum {
            model: RankAccum::default(),
            random: RankAccum::default(),
            miss: 0,
            targets: 0,
        };

        for relation in self.dataset.test_relations() {
            let name = self
                .dataset
                .relation_names
                .get(relation)
                .cloned()
                .unwrap_or_else(|| relation.to_string());
            let Some(accum) = self.relation_accum(relation)? else {
                continue;
            };
            let metrics = metrics_row(&name, &accum);
            info!(
                "relation {}: mean_rank {:.2}, mrr {:.4}, {} pairs, {} misses, {} targets",
                name, metrics.mean_rank, metrics.mrr, accum.model.pairs, accum.miss, accum.targets
            );
            overall.model.merge(&accum.model);
            overall.random.merge(&accum.random);
            overall.miss += accum.miss;
            rows.push(metrics);
        }

        let mut overall_row = metrics_row(OVERALL_ROW, &overall);
        overall_row.targets = -1;
        info!(
            "OVERALL: mean_rank {:.2}, mrr {:.4}, {} pairs, {} misses",
            overall_row.mean_rank, overall_row.mrr, overall.model.pairs, overall.miss
        );

        Ok(EvaluationReport {
            rows,
            overall: overall_row,
        })
    }

    fn relation_accum(&mut self, relation: usize) -> Result<Option<RelationAccum>> {
        let pool: Vec<usize> = match self.dataset.relation_targets(relation) {
            Some(pool) if !pool.is_empty() => pool.to_vec(),
            _ => {
                warn!(
                    "relation {} has no known valid targets, skipping",
                    relation
                );
                return Ok(None);
            }
        };

        self.precompute(relation, &pool)?;
        let pool_index: HashMap<usize, usize> =
            pool.iter().enumerate().map(|(i, &t)| (t, i)).collect();

        let mut accum = RelationAccum {
            model: RankAccum::default(),
            random: RankAccum::default(),
            miss: 0,
            targets: pool.len(),
        };

        for head in self.dataset.query_heads(relation) {
            let Some(eval_true) = self.dataset.eval_true(head, relation) else {
                continue;
            };

            // True targets outside the candidate pool cannot be ranked
            let eval_idx: Vec<usize> = eval_true
                .iter()
                .filter_map(|t| pool_index.get(t).copied())
                .collect();
            accum.miss += eval_true.len() - eval_idx.len();
            if eval_idx.is_empty() {
                continue;
            }

            // The filter superset covers at least the evaluated targets
            let mut filter_idx: HashSet<usize> = eval_idx.iter().copied().collect();
            if let Some(filter_true) = self.dataset.filter_true(head, relation) {
                filter_idx.extend(
                    filter_true
                        .iter()
                        .filter_map(|t| pool_index.get(t).copied()),
                );
            }

            let scores = self.score_query(head, relation)?;
            accum
                .model
                .add_query(&filtered_ranks(&scores, &filter_idx, &eval_idx));

            let random: Vec<f32> = (0..scores.len()).map(|_| self.rng.gen()).collect();
            accum
                .random
                .add_query(&filtered_ranks(&random, &filter_idx, &eval_idx));
        }

        self.drain(pool.len())?;
        Ok(Some(accum))
    }
}

fn metrics_row(name: &str, accum: &RelationAccum) -> RelationMetrics {
    RelationMetrics {
        relationship: name.to_string(),
        mean_rank: accum.model.mean_rank(),
        mrr: accum.model.mrr(),
        mrr_per_triple: accum.model.mrr_per_triple(),
        rand_mean_rank: accum.random.mean_rank(),
        rand_mrr: accum.random.mrr(),
        rand_mrr_per_triple: accum.random.mrr_per_triple(),
        miss: accum.miss,
        triples: accum.model.pairs,
        targets: accum.targets as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conmask::tests::tiny_model;
    use crate::Triple;

    fn set(indices: &[usize]) -> HashSet<usize> {
        indices.iter().copied().collect()
    }

    #[test]
    fn test_rank_counts_strictly_greater_scores() {
        // One evaluated target, nothing else true
        let scores = [0.3, 0.7, 0.5, 0.5];
        let ranks = filtered_ranks(&scores, &set(&[2]), &[2]);
        // Only 0.7 is strictly greater; ties do not count
        assert_eq!(ranks, vec![2]);
    }

    #[test]
    fn test_rank_ignores_filtered_true_targets() {
        // The top-scoring candidate is a known true answer; it must not
        // occupy a position ahead of the evaluated target
        let scores = [0.95, 0.4, 0.6];
        let unfiltered = filtered_ranks(&scores, &set(&[1]), &[1]);
        assert_eq!(unfiltered, vec![3]);
        let filtered = filtered_ranks(&scores, &set(&[0, 1]), &[1]);
        assert_eq!(filtered, vec![2]);
    }

    #[test]
    fn test_three_candidate_scenario_unfiltered() {
        // Scores [0.9, 0.5, 0.1], evaluated target at 0.5, nothing else
        // filtered: rank 2, reciprocal rank 0.5
        let scores = [0.9, 0.5, 0.1];
        let ranks = filtered_ranks(&scores, &set(&[1]), &[1]);
        assert_eq!(ranks, vec![2]);

        let mut accum = RankAccum::default();
        accum.add_query(&ranks);
        assert!((accum.mrr() - 0.5).abs() < 1e-12);
        assert!((accum.mean_rank() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_three_candidate_scenario_filtered() {
        // Same pool, but the 0.9 candidate is known-true and filtered:
        // rank 1, reciprocal rank 1.0
        let scores = [0.9, 0.5, 0.1];
        let ranks = filtered_ranks(&scores, &set(&[0, 1]), &[1]);
        assert_eq!(ranks, vec![1]);

        let mut accum = RankAccum::default();
        accum.add_query(&ranks);
        assert!((accum.mrr() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_accum_best_rr_per_pair() {
        let mut accum = RankAccum::default();
        accum.add_query(&[1, 4]);
        // Both pairs contribute the query's best reciprocal rank, 1.0
        assert_eq!(accum.pairs, 2);
        assert!((accum.mrr_per_triple() - 1.0).abs() < 1e-12);
        // A single query's mrr is the mean of 1/1 and 1/4
        assert!((accum.mrr() - 0.625).abs() < 1e-12);
    }

    #[test]
    fn test_mrr_averages_per_query_not_per_pair() {
        // Queries with ranks [1] and [2, 2]: each query contributes one
        // reciprocal-rank value, so mrr = (1.0 + 0.5) / 2, not the
        // per-pair mean (1.0 + 0.5 + 0.5) / 3
        let mut accum = RankAccum::default();
        accum.add_query(&[1]);
        accum.add_query(&[2, 2]);
        assert_eq!(accum.queries, 2);
        assert_eq!(accum.pairs, 3);
        assert!((accum.mrr() - 0.75).abs() < 1e-12);
        // mean_rank and mrr_per_triple stay per-pair
        assert!((accum.mean_rank() - 5.0 / 3.0).abs() < 1e-12);
        assert!((accum.mrr_per_triple() - 2.0 / 3.0).abs() < 1e-12);
    }

    fn tiny_dataset() -> KgDataset {
        KgDataset::from_triples(
            vec!["e0".into(), "e1".into(), "e2".into(), "e3".into()],
            vec!["near".into(), "colored".into()],
            vec![
                Triple::new(0, 0, 1),
                Triple::new(0, 0, 2),
                Triple::new(3, 0, 1),
                Triple::new(0, 1, 3),
            ],
            vec![Triple::new(0, 0, 2), Triple::new(3, 0, 2)],
        )
    }

    #[test]
    fn test_cache_invariant_through_relation_cycle() {
        let model = tiny_model();
        let dataset = tiny_dataset();
        let mut evaluator = RankingEvaluator::with_config(
            &model,
            &dataset,
            EvaluationConfig {
                chunk_size: 1,
                seed: Some(7),
            },
        );

        let pool = dataset.relation_targets(0).unwrap().to_vec();
        evaluator.precompute(0, &pool).unwrap();
        assert_eq!(evaluator.cache_len(), pool.len());

        let scores = evaluator.score_query(0, 0).unwrap();
        assert_eq!(scores.len(), pool.len());
        assert_eq!(evaluator.cache_len(), pool.len());

        evaluator.drain(pool.len()).unwrap();
        assert_eq!(evaluator.cache_len(), 0);
    }

    #[test]
    fn test_evaluate_all_produces_rows_and_overall() {
        let model = tiny_model();
        let dataset = tiny_dataset();
        let mut evaluator = RankingEvaluator::with_config(
            &model,
            &dataset,
            EvaluationConfig {
                chunk_size: 500,
                seed: Some(7),
            },
        );

        let report = evaluator.evaluate_all().unwrap();
        // Only relation 0 appears in the test triples
        assert_eq!(report.rows.len(), 1);
        let row = &report.rows[0];
        assert_eq!(row.relationship, "near");
        assert_eq!(row.targets, 2);
        assert!(row.mean_rank >= 1.0);
        assert!(row.mrr > 0.0 && row.mrr <= 1.0);
        assert_eq!(row.miss, 0);
        assert_eq!(row.triples, 2);

        assert_eq!(report.overall.relationship, OVERALL_ROW);
        assert_eq!(report.overall.targets, -1);
        assert_eq!(report.overall.triples, 2);
        assert_eq!(evaluator.cache_len(), 0);
    }

    #[test]
    fn test_relation_without_targets_is_skipped() {
        let model = tiny_model();
        // Relation 1 appears in test but has no train tails, so its pool
        // is unknown and the relation is skipped with a warning
        let dataset = KgDataset::from_triples(
            vec!["e0".into(), "e1".into(), "e2".into(), "e3".into()],
            vec!["near".into(), "colored".into()],
            vec![Triple::new(0, 0, 1)],
            vec![Triple::new(0, 1, 2)],
        );
        let mut evaluator = RankingEvaluator::new(&model, &dataset);
        let report = evaluator.evaluate_all().unwrap();
        assert!(report.rows.is_empty());
        assert_eq!(report.overall.triples, 0);
    }

    #[test]
    fn test_miss_counts_out_of_pool_targets() {
        let model = tiny_model();
        // Evaluated tail 3 never appears as a train tail of relation 0, so
        // it is outside the candidate pool and counts as a miss
        let dataset = KgDataset::from_triples(
            vec!["e0".into(), "e1".into(), "e2".into(), "e3".into()],
            vec!["near".into(), "colored".into()],
            vec![Triple::new(0, 0, 1), Triple::new(0, 0, 2)],
            vec![Triple::new(0, 0, 2), Triple::new(0, 0, 3)],
        );
        let mut evaluator = RankingEvaluator::with_config(
            &model,
            &dataset,
            EvaluationConfig {
                chunk_size: 500,
                seed: Some(1),
            },
        );
        let report = evaluator.evaluate_all().unwrap();
        let row = &report.rows[0];
        assert_eq!(row.miss, 1);
        // Misses are reported in their own column, never counted as
        // ranked triples
        assert_eq!(row.triples, 1);
        assert_eq!(report.overall.triples, 1);
        assert_eq!(report.overall.miss, 1);
    }
}
