//! Model evaluation command

use super::CommandResult;
use conrank_embed::{
    CheckpointManager, EvaluationConfig, ModelConfig, RankingEvaluator, ReportExporter,
};
use std::path::PathBuf;
use std::time::Instant;

/// Rank every test relation against its candidate pool and write the
/// metrics report
pub async fn run(
    data: PathBuf,
    checkpoints: PathBuf,
    output: PathBuf,
    content_width: usize,
    title_width: usize,
    seed: Option<u64>,
) -> CommandResult {
    println!("Evaluating dataset '{}'", data.display());

    let (mut model, dataset) =
        super::load_model(&data, content_width, title_width, ModelConfig::default())?;
    println!(
        "Loaded {} entities, {} relations, {} test triples",
        dataset.num_entities(),
        dataset.num_relations(),
        dataset.test_triples.len()
    );

    let manager = CheckpointManager::new(&checkpoints, 3)?;
    match manager.restore_latest(&mut model)? {
        Some(path) => println!(
            "Restored {} at step {}",
            path.display(),
            model.global_step()
        ),
        None => println!("No checkpoint found, evaluating a freshly initialized model"),
    }

    let config = EvaluationConfig {
        seed,
        ..Default::default()
    };
    let mut evaluator = RankingEvaluator::with_config(&model, &dataset, config);

    let start = Instant::now();
    println!("Starting evaluation...");
    let report = evaluator.evaluate_all()?;

    println!(
        "Evaluation completed in {:.2} seconds",
        start.elapsed().as_secs_f64()
    );
    println!(
        "Relations evaluated: {}, triples: {}, misses: {}",
        report.rows.len(),
        report.overall.triples,
        report.overall.miss
    );
    println!(
        "OVERALL mean_rank: {:.2}, mrr: {:.4}, mrr_per_triple: {:.4}",
        report.overall.mean_rank, report.overall.mrr, report.overall.mrr_per_triple
    );

    ReportExporter::export_to_csv(&report, output.to_string_lossy().as_ref())?;
    println!("Report written to {}", output.display());
    Ok(())
}
