//! Embedding model implementations
//!
//! `base` carries the bookkeeping shared by model implementations,
//! `extractor` the content feature-extraction building blocks, and
//! `conmask` the content-mask model that ties them together.

pub mod base;
pub mod conmask;
pub mod extractor;

pub use conmask::{ContentMaskConfig, ContentMaskEmbedding, EntityRepr, SIMILARITY_CHANNELS};
pub use extractor::{avg_content, mask_content, ContentExtractor, ConvFilter, Mode};
