//! CLI command implementations

use conrank_embed::models::{ContentMaskConfig, ContentMaskEmbedding};
use conrank_embed::{ContentStore, KgDataset, ModelConfig};
use std::path::Path;

pub mod evaluate;
pub mod train;

pub type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Load the dataset and content store and build a fresh model over them.
/// The embedding dimension comes from the store's `embed.txt` width.
pub(crate) fn load_model(
    data: &Path,
    content_width: usize,
    title_width: usize,
    base: ModelConfig,
) -> anyhow::Result<(ContentMaskEmbedding, KgDataset)> {
    let dataset = KgDataset::load(data)?;
    let store = ContentStore::load(
        data,
        dataset.num_entities(),
        dataset.num_relations(),
        content_width,
        title_width,
    )?;
    let config = ContentMaskConfig {
        base_config: base.with_dimensions(store.dim()),
        max_content_len: content_width,
        max_title_len: title_width,
        ..Default::default()
    };
    let model = ContentMaskEmbedding::from_dataset(config, store, &dataset)?;
    Ok((model, dataset))
}
