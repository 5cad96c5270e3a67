//! Model training command

use super::CommandResult;
use conrank_embed::{CheckpointManager, ModelConfig, Trainer, TrainingConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

/// Train the model over a dataset directory with periodic checkpoints
#[allow(clippy::too_many_arguments)]
pub async fn run(
    data: PathBuf,
    checkpoints: PathBuf,
    steps: Option<u64>,
    epochs: usize,
    batch_size: usize,
    lr: f64,
    content_width: usize,
    title_width: usize,
) -> CommandResult {
    println!("Training on dataset '{}'", data.display());
    println!("Checkpoints: {}", checkpoints.display());

    let base = ModelConfig::default()
        .with_batch_size(batch_size)
        .with_learning_rate(lr)
        .with_max_epochs(epochs);
    let (mut model, dataset) = super::load_model(&data, content_width, title_width, base)?;
    println!(
        "Loaded {} entities, {} relations, {} train triples",
        dataset.num_entities(),
        dataset.num_relations(),
        dataset.train_triples.len()
    );

    let manager = CheckpointManager::new(&checkpoints, 3)?;
    if let Some(path) = manager.restore_latest(&mut model)? {
        println!(
            "Resumed from {} at step {}",
            path.display(),
            model.global_step()
        );
    }

    // Negative sampling draws from the dataset pools, which already
    // exclude avoided entities
    let pools: HashMap<usize, Vec<usize>> = (0..dataset.num_relations())
        .filter_map(|r| dataset.relation_targets(r).map(|pool| (r, pool.to_vec())))
        .collect();

    let config = TrainingConfig {
        batch_size,
        learning_rate: lr,
        max_epochs: epochs,
        max_steps: steps,
        ..Default::default()
    };
    let trainer = Trainer::new(config)
        .with_checkpoints(manager)
        .with_pools(pools);

    let start = Instant::now();
    println!("Starting training...");
    let stats = trainer.train(&mut model, None)?;

    println!(
        "Training completed in {:.2} seconds",
        start.elapsed().as_secs_f64()
    );
    println!(
        "Epochs: {}, final loss: {:.6}, global step: {}",
        stats.epochs_completed,
        stats.final_loss,
        model.global_step()
    );
    Ok(())
}
