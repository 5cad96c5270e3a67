//! Vocabulary, word-embedding table, and entity/relation content store
//!
//! The store is loaded once at startup from line-oriented text files and
//! serves token lookups for descriptions and titles. Word id 0 is the
//! PAD/unknown token; any out-of-vocabulary id resolves to its embedding
//! row, so downstream math never sees a missing word.

use crate::EmbeddingError;
use anyhow::{anyhow, Context, Result};
use ndarray::{Array1, Array2};
use std::fs;
use std::path::Path;
use tracing::info;

pub const VOCAB_FILE: &str = "vocab.txt";
pub const EMBED_FILE: &str = "embed.txt";
pub const DESCRIPTIONS_FILE: &str = "descriptions.txt";
pub const ENTITY_NAMES_FILE: &str = "entity_names.txt";
pub const RELATION_NAMES_FILE: &str = "relation_names.txt";

/// Reserved PAD/unknown word id
pub const PAD_WORD: usize = 0;

/// A token sequence padded to a fixed width, with its valid length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSeq {
    tokens: Vec<usize>,
    len: usize,
}

impl TokenSeq {
    /// Truncate to `width` tokens and pad the remainder with PAD
    pub fn new(mut tokens: Vec<usize>, width: usize) -> Self {
        tokens.truncate(width);
        let len = tokens.len();
        tokens.resize(width, PAD_WORD);
        Self { tokens, len }
    }

    pub fn empty(width: usize) -> Self {
        Self {
            tokens: vec![PAD_WORD; width],
            len: 0,
        }
    }

    /// Padded token ids (always `width` long)
    pub fn tokens(&self) -> &[usize] {
        &self.tokens
    }

    /// Number of non-pad tokens at the front of the sequence
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Word vocabulary, embedding table, and per-id content tables
#[derive(Debug)]
pub struct ContentStore {
    vocab: Vec<String>,
    embeddings: Array2<f32>,
    entity_descriptions: Vec<TokenSeq>,
    entity_titles: Vec<TokenSeq>,
    relation_titles: Vec<TokenSeq>,
    content_width: usize,
    title_width: usize,
}

impl ContentStore {
    /// Build a store from already-parsed tables. Used directly by tests;
    /// production code goes through [`ContentStore::load`].
    pub fn new(
        vocab: Vec<String>,
        embeddings: Array2<f32>,
        entity_descriptions: Vec<TokenSeq>,
        entity_titles: Vec<TokenSeq>,
        relation_titles: Vec<TokenSeq>,
    ) -> Result<Self> {
        if embeddings.nrows() != vocab.len() {
            return Err(anyhow!(
                "embedding table has {} rows for {} vocabulary words",
                embeddings.nrows(),
                vocab.len()
            ));
        }
        if entity_descriptions.len() != entity_titles.len() {
            return Err(anyhow!(
                "{} descriptions for {} entity titles",
                entity_descriptions.len(),
                entity_titles.len()
            ));
        }
        let content_width = entity_descriptions.first().map_or(0, |s| s.tokens.len());
        let title_width = entity_titles.first().map_or(0, |s| s.tokens.len());
        Ok(Self {
            vocab,
            embeddings,
            entity_descriptions,
            entity_titles,
            relation_titles,
            content_width,
            title_width,
        })
    }

    /// Load the store from a dataset directory.
    ///
    /// Expects `vocab.txt`, `embed.txt`, `descriptions.txt`,
    /// `entity_names.txt`, and `relation_names.txt`; row counts must match
    /// the vocabulary and the given entity/relation counts.
    pub fn load(
        dir: &Path,
        num_entities: usize,
        num_relations: usize,
        content_width: usize,
        title_width: usize,
    ) -> Result<Self> {
        let vocab = read_lines(&dir.join(VOCAB_FILE))?;
        if vocab.is_empty() {
            return Err(anyhow!("empty vocabulary in {}", dir.display()));
        }

        let embeddings = load_embedding_table(&dir.join(EMBED_FILE), vocab.len())?;

        let entity_descriptions = load_token_table(
            &dir.join(DESCRIPTIONS_FILE),
            num_entities,
            content_width,
        )?;
        let entity_titles =
            load_token_table(&dir.join(ENTITY_NAMES_FILE), num_entities, title_width)?;
        let relation_titles =
            load_token_table(&dir.join(RELATION_NAMES_FILE), num_relations, title_width)?;

        info!(
            "Loaded content store: {} words, dim {}, {} entities, {} relations",
            vocab.len(),
            embeddings.ncols(),
            num_entities,
            num_relations
        );

        Ok(Self {
            vocab,
            embeddings,
            entity_descriptions,
            entity_titles,
            relation_titles,
            content_width,
            title_width,
        })
    }

    /// Word embedding dimensionality
    pub fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn num_entities(&self) -> usize {
        self.entity_descriptions.len()
    }

    pub fn num_relations(&self) -> usize {
        self.relation_titles.len()
    }

    pub fn content_width(&self) -> usize {
        self.content_width
    }

    pub fn title_width(&self) -> usize {
        self.title_width
    }

    /// The PAD embedding row, used as the fallback for empty sequences
    pub fn pad_vector(&self) -> Array1<f32> {
        self.embeddings.row(PAD_WORD).to_owned()
    }

    pub fn description(&self, entity: usize) -> Result<&TokenSeq> {
        self.entity_descriptions
            .get(entity)
            .ok_or_else(|| anyhow!("no description for entity id {}", entity))
    }

    pub fn entity_title(&self, entity: usize) -> Result<&TokenSeq> {
        self.entity_titles
            .get(entity)
            .ok_or_else(|| anyhow!("no title for entity id {}", entity))
    }

    pub fn relation_title(&self, relation: usize) -> Result<&TokenSeq> {
        self.relation_titles
            .get(relation)
            .ok_or_else(|| anyhow!("no title for relation id {}", relation))
    }

    /// Resolve a token sequence into its embedding rows, one row per padded
    /// position. Unknown ids fall back to the PAD row.
    pub fn embed_sequence(&self, seq: &TokenSeq) -> Array2<f32> {
        let dim = self.dim();
        let mut out = Array2::zeros((seq.tokens.len(), dim));
        for (i, &token) in seq.tokens.iter().enumerate() {
            let row = if token < self.embeddings.nrows() {
                self.embeddings.row(token)
            } else {
                self.embeddings.row(PAD_WORD)
            };
            out.row_mut(i).assign(&row);
        }
        out
    }

    /// Trainable embedding table, mutated only by the optimizer
    pub fn embeddings(&self) -> &Array2<f32> {
        &self.embeddings
    }

    pub fn embeddings_mut(&mut self) -> &mut Array2<f32> {
        &mut self.embeddings
    }

    /// Replace the embedding table, e.g. from a restored checkpoint
    pub fn set_embeddings(&mut self, embeddings: Array2<f32>) -> Result<()> {
        if embeddings.nrows() != self.vocab.len() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.vocab.len(),
                actual: embeddings.nrows(),
            }
            .into());
        }
        self.embeddings = embeddings;
        Ok(())
    }
}

/// Read a file into trimmed lines, keeping interior empty lines (they are
/// meaningful: an empty description is a valid row)
pub(crate) fn read_lines(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(raw.lines().map(|l| l.trim_end().to_string()).collect())
}

pub(crate) fn parse_ids(line: &str, path: &Path, lineno: usize) -> Result<Vec<usize>> {
    line.split_whitespace()
        .map(|tok| {
            tok.parse::<usize>()
                .with_context(|| format!("{}:{}: bad id {:?}", path.display(), lineno + 1, tok))
        })
        .collect()
}

fn load_token_table(path: &Path, expected_rows: usize, width: usize) -> Result<Vec<TokenSeq>> {
    let lines = read_lines(path)?;
    if lines.len() != expected_rows {
        return Err(anyhow!(
            "{}: {} rows, expected {}",
            path.display(),
            lines.len(),
            expected_rows
        ));
    }
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| Ok(TokenSeq::new(parse_ids(line, path, i)?, width)))
        .collect()
}

fn load_embedding_table(path: &Path, expected_rows: usize) -> Result<Array2<f32>> {
    let lines = read_lines(path)?;
    if lines.len() != expected_rows {
        return Err(anyhow!(
            "{}: {} embedding rows, expected {}",
            path.display(),
            lines.len(),
            expected_rows
        ));
    }

    let mut dim = 0usize;
    let mut values: Vec<f32> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let row: Vec<f32> = line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f32>().with_context(|| {
                    format!("{}:{}: bad float {:?}", path.display(), i + 1, tok)
                })
            })
            .collect::<Result<_>>()?;
        if i == 0 {
            dim = row.len();
            if dim == 0 {
                return Err(anyhow!("{}:1: empty embedding row", path.display()));
            }
        } else if row.len() != dim {
            return Err(anyhow!(
                "{}:{}: row width {} differs from {}",
                path.display(),
                i + 1,
                row.len(),
                dim
            ));
        }
        values.extend(row);
    }

    Array2::from_shape_vec((expected_rows, dim), values)
        .map_err(|e| anyhow!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_token_seq_pads_and_truncates() {
        let seq = TokenSeq::new(vec![3, 7], 4);
        assert_eq!(seq.tokens(), &[3, 7, 0, 0]);
        assert_eq!(seq.len(), 2);

        let seq = TokenSeq::new(vec![1, 2, 3, 4, 5], 3);
        assert_eq!(seq.tokens(), &[1, 2, 3]);
        assert_eq!(seq.len(), 3);

        let seq = TokenSeq::empty(2);
        assert_eq!(seq.tokens(), &[0, 0]);
        assert!(seq.is_empty());
    }

    #[test]
    fn test_unknown_token_resolves_to_pad_row() {
        let store = tiny_store();
        let seq = TokenSeq::new(vec![99], 2);
        let rows = store.embed_sequence(&seq);
        assert_eq!(rows.row(0), store.pad_vector());
        assert_eq!(rows.row(1), store.pad_vector());
    }

    #[test]
    fn test_embed_sequence_preserves_order() {
        let store = tiny_store();
        let seq = TokenSeq::new(vec![2, 1], 3);
        let rows = store.embed_sequence(&seq);
        assert_eq!(rows.row(0).to_vec(), vec![2.0, 0.2]);
        assert_eq!(rows.row(1).to_vec(), vec![1.0, 0.1]);
        assert_eq!(rows.row(2), store.pad_vector());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), VOCAB_FILE, "<pad>\nalpha\nbeta\n");
        write_file(
            dir.path(),
            EMBED_FILE,
            "0.0 0.0\n1.0 0.5\n-1.0 0.25\n",
        );
        write_file(dir.path(), DESCRIPTIONS_FILE, "1 2 1\n\n");
        write_file(dir.path(), ENTITY_NAMES_FILE, "1\n2\n");
        write_file(dir.path(), RELATION_NAMES_FILE, "2 1\n");

        let store = ContentStore::load(dir.path(), 2, 1, 4, 2).unwrap();
        assert_eq!(store.vocab_size(), 3);
        assert_eq!(store.dim(), 2);
        assert_eq!(store.description(0).unwrap().len(), 3);
        // The empty second description is a valid zero-length row
        assert!(store.description(1).unwrap().is_empty());
        assert_eq!(store.relation_title(0).unwrap().tokens(), &[2, 1]);
    }

    #[test]
    fn test_load_rejects_ragged_embedding_rows() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), VOCAB_FILE, "<pad>\na\n");
        write_file(dir.path(), EMBED_FILE, "0.0 0.0\n1.0\n");
        write_file(dir.path(), DESCRIPTIONS_FILE, "1\n");
        write_file(dir.path(), ENTITY_NAMES_FILE, "1\n");
        write_file(dir.path(), RELATION_NAMES_FILE, "1\n");

        let err = ContentStore::load(dir.path(), 1, 1, 4, 2).unwrap_err();
        assert!(err.to_string().contains("row width"));
    }

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn tiny_store() -> ContentStore {
        let vocab = vec!["<pad>".to_string(), "a".to_string(), "b".to_string()];
        let embeddings = ndarray::arr2(&[[0.0, 0.0], [1.0, 0.1], [2.0, 0.2]]);
        ContentStore::new(
            vocab,
            embeddings,
            vec![TokenSeq::new(vec![1, 2], 4), TokenSeq::empty(4)],
            vec![TokenSeq::new(vec![1], 2), TokenSeq::new(vec![2], 2)],
            vec![TokenSeq::new(vec![1, 2], 2)],
        )
        .unwrap()
    }
}
