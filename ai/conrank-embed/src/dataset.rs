//! Knowledge graph dataset: triples, target pools, and filter indexes
//!
//! A dataset directory holds `entities.txt`/`relations.txt` (line number =
//! id), `train.txt`/`test.txt` (one `head rel tail` triple per line), an
//! optional `avoid_entities.txt` exclusion list, and three optional parallel
//! `.idx`/`.values` index pairs: per-relation candidate target pools, the
//! per-query true tails to evaluate, and the per-query known-true supersets
//! used by the filtered-rank protocol. When an index pair is absent it is
//! derived from the triples, so a bare triple dump remains evaluable.

use crate::content::{parse_ids, read_lines};
use crate::Triple;
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

pub const ENTITIES_FILE: &str = "entities.txt";
pub const RELATIONS_FILE: &str = "relations.txt";
pub const TRAIN_FILE: &str = "train.txt";
pub const TEST_FILE: &str = "test.txt";
pub const AVOID_FILE: &str = "avoid_entities.txt";
pub const RELATION_TARGETS_PREFIX: &str = "relation_targets";
pub const EVAL_TRUE_PREFIX: &str = "eval_true";
pub const FILTER_TRUE_PREFIX: &str = "filter_true";

/// Loaded dataset tables
#[derive(Debug)]
pub struct KgDataset {
    pub entity_names: Vec<String>,
    pub relation_names: Vec<String>,
    pub train_triples: Vec<Triple>,
    pub test_triples: Vec<Triple>,
    relation_targets: HashMap<usize, Vec<usize>>,
    eval_true: HashMap<(usize, usize), Vec<usize>>,
    filter_true: HashMap<(usize, usize), HashSet<usize>>,
    avoid: HashSet<usize>,
    known_positives: HashSet<(usize, usize, usize)>,
}

impl KgDataset {
    pub fn load(dir: &Path) -> Result<Self> {
        let entity_names = read_lines(&dir.join(ENTITIES_FILE))?;
        let relation_names = read_lines(&dir.join(RELATIONS_FILE))?;
        let num_entities = entity_names.len();
        let num_relations = relation_names.len();

        let train_triples =
            load_triples(&dir.join(TRAIN_FILE), num_entities, num_relations)?;
        let test_triples =
            load_triples(&dir.join(TEST_FILE), num_entities, num_relations)?;

        let avoid = load_avoid_list(dir, num_entities)?;

        let relation_targets = match load_index_pair(dir, RELATION_TARGETS_PREFIX, 1)? {
            Some(entries) => {
                let mut map = HashMap::new();
                for (key, values) in entries {
                    map.insert(key[0], values);
                }
                map
            }
            None => {
                debug!("no relation target index, deriving pools from train triples");
                derive_relation_targets(&train_triples)
            }
        };
        // Avoided entities never appear in a candidate pool
        let relation_targets: HashMap<usize, Vec<usize>> = relation_targets
            .into_iter()
            .map(|(rel, pool)| {
                (
                    rel,
                    pool.into_iter().filter(|t| !avoid.contains(t)).collect(),
                )
            })
            .collect();

        let eval_true = match load_index_pair(dir, EVAL_TRUE_PREFIX, 2)? {
            Some(entries) => entries
                .into_iter()
                .map(|(key, values)| ((key[0], key[1]), values))
                .collect(),
            None => {
                debug!("no eval-true index, deriving from test triples");
                derive_eval_true(&test_triples)
            }
        };

        let filter_true: HashMap<(usize, usize), HashSet<usize>> =
            match load_index_pair(dir, FILTER_TRUE_PREFIX, 2)? {
                Some(entries) => entries
                    .into_iter()
                    .map(|(key, values)| ((key[0], key[1]), values.into_iter().collect()))
                    .collect(),
                None => {
                    debug!("no filter-true index, deriving from train and test triples");
                    derive_filter_true(&train_triples, &eval_true)
                }
            };

        let known_positives = train_triples
            .iter()
            .map(|t| (t.head, t.relation, t.tail))
            .collect();

        info!(
            "Loaded dataset: {} entities, {} relations, {} train / {} test triples, {} avoided",
            num_entities,
            num_relations,
            train_triples.len(),
            test_triples.len(),
            avoid.len()
        );

        Ok(Self {
            entity_names,
            relation_names,
            train_triples,
            test_triples,
            relation_targets,
            eval_true,
            filter_true,
            avoid,
            known_positives,
        })
    }

    /// Build a dataset from in-memory tables (tests and synthetic data)
    pub fn from_triples(
        entity_names: Vec<String>,
        relation_names: Vec<String>,
        train_triples: Vec<Triple>,
        test_triples: Vec<Triple>,
    ) -> Self {
        let relation_targets = derive_relation_targets(&train_triples);
        let eval_true = derive_eval_true(&test_triples);
        let filter_true = derive_filter_true(&train_triples, &eval_true);
        let known_positives = train_triples
            .iter()
            .map(|t| (t.head, t.relation, t.tail))
            .collect();
        Self {
            entity_names,
            relation_names,
            train_triples,
            test_triples,
            relation_targets,
            eval_true,
            filter_true,
            avoid: HashSet::new(),
            known_positives,
        }
    }

    pub fn num_entities(&self) -> usize {
        self.entity_names.len()
    }

    pub fn num_relations(&self) -> usize {
        self.relation_names.len()
    }

    /// Candidate target pool for a relation, or None when the relation has
    /// no known valid targets
    pub fn relation_targets(&self, relation: usize) -> Option<&[usize]> {
        self.relation_targets
            .get(&relation)
            .map(|pool| pool.as_slice())
    }

    /// True tails to be ranked for a (head, relation) query
    pub fn eval_true(&self, head: usize, relation: usize) -> Option<&[usize]> {
        self.eval_true
            .get(&(head, relation))
            .map(|v| v.as_slice())
    }

    /// All known-true tails for a query, the filtered-rank exclusion set
    pub fn filter_true(&self, head: usize, relation: usize) -> Option<&HashSet<usize>> {
        self.filter_true.get(&(head, relation))
    }

    pub fn is_known_positive(&self, head: usize, relation: usize, tail: usize) -> bool {
        self.known_positives.contains(&(head, relation, tail))
    }

    pub fn avoid(&self) -> &HashSet<usize> {
        &self.avoid
    }

    /// Distinct relations present in the test triples, ascending
    pub fn test_relations(&self) -> Vec<usize> {
        let mut rels: Vec<usize> = self
            .test_triples
            .iter()
            .map(|t| t.relation)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        rels.sort_unstable();
        rels
    }

    /// Distinct query heads for a relation, in first-seen test order
    pub fn query_heads(&self, relation: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        self.test_triples
            .iter()
            .filter(|t| t.relation == relation)
            .filter_map(|t| seen.insert(t.head).then_some(t.head))
            .collect()
    }
}

fn load_triples(path: &Path, num_entities: usize, num_relations: usize) -> Result<Vec<Triple>> {
    let lines = read_lines(path)?;
    let mut triples = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        let ids = parse_ids(line, path, i)?;
        if ids.len() != 3 {
            return Err(anyhow!(
                "{}:{}: expected 3 fields, found {}",
                path.display(),
                i + 1,
                ids.len()
            ));
        }
        let (head, relation, tail) = (ids[0], ids[1], ids[2]);
        if head >= num_entities || tail >= num_entities {
            return Err(anyhow!(
                "{}:{}: entity id out of range (have {} entities)",
                path.display(),
                i + 1,
                num_entities
            ));
        }
        if relation >= num_relations {
            return Err(anyhow!(
                "{}:{}: relation id {} out of range (have {} relations)",
                path.display(),
                i + 1,
                relation,
                num_relations
            ));
        }
        triples.push(Triple::new(head, relation, tail));
    }
    Ok(triples)
}

fn load_avoid_list(dir: &Path, num_entities: usize) -> Result<HashSet<usize>> {
    let path = dir.join(AVOID_FILE);
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let lines = read_lines(&path)?;
    let mut avoid = HashSet::new();
    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        let ids = parse_ids(line, &path, i)?;
        for id in ids {
            if id >= num_entities {
                return Err(anyhow!(
                    "{}:{}: entity id {} out of range",
                    path.display(),
                    i + 1,
                    id
                ));
            }
            avoid.insert(id);
        }
    }
    Ok(avoid)
}

/// Load a parallel `.idx`/`.values` file pair. Line `k` of the idx file is a
/// key of `key_width` ids; line `k` of the values file is the id list for
/// that key. Returns None when the pair is absent.
#[allow(clippy::type_complexity)]
fn load_index_pair(
    dir: &Path,
    prefix: &str,
    key_width: usize,
) -> Result<Option<Vec<(Vec<usize>, Vec<usize>)>>> {
    let idx_path = dir.join(format!("{prefix}.idx"));
    let values_path = dir.join(format!("{prefix}.values"));
    if !idx_path.exists() && !values_path.exists() {
        return Ok(None);
    }
    let idx_lines = read_lines(&idx_path)?;
    let values_lines = read_lines(&values_path)?;
    if idx_lines.len() != values_lines.len() {
        return Err(anyhow!(
            "{} has {} keys but {} has {} rows",
            idx_path.display(),
            idx_lines.len(),
            values_path.display(),
            values_lines.len()
        ));
    }

    let mut entries = Vec::with_capacity(idx_lines.len());
    for (i, (key_line, values_line)) in idx_lines.iter().zip(&values_lines).enumerate() {
        let key = parse_ids(key_line, &idx_path, i)?;
        if key.len() != key_width {
            return Err(anyhow!(
                "{}:{}: expected {} key fields, found {}",
                idx_path.display(),
                i + 1,
                key_width,
                key.len()
            ));
        }
        let values = parse_ids(values_line, &values_path, i)?;
        entries.push((key, values));
    }
    Ok(Some(entries))
}

fn derive_relation_targets(train: &[Triple]) -> HashMap<usize, Vec<usize>> {
    let mut sets: HashMap<usize, HashSet<usize>> = HashMap::new();
    for t in train {
        sets.entry(t.relation).or_default().insert(t.tail);
    }
    sets.into_iter()
        .map(|(rel, set)| {
            let mut pool: Vec<usize> = set.into_iter().collect();
            pool.sort_unstable();
            (rel, pool)
        })
        .collect()
}

fn derive_eval_true(test: &[Triple]) -> HashMap<(usize, usize), Vec<usize>> {
    let mut map: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
    for t in test {
        let entry = map.entry((t.head, t.relation)).or_default();
        if !entry.contains(&t.tail) {
            entry.push(t.tail);
        }
    }
    map
}

fn derive_filter_true(
    train: &[Triple],
    eval_true: &HashMap<(usize, usize), Vec<usize>>,
) -> HashMap<(usize, usize), HashSet<usize>> {
    let mut map: HashMap<(usize, usize), HashSet<usize>> = HashMap::new();
    for ((head, relation), tails) in eval_true {
        map.entry((*head, *relation))
            .or_default()
            .extend(tails.iter().copied());
    }
    for t in train {
        if let Some(set) = map.get_mut(&(t.head, t.relation)) {
            set.insert(t.tail);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn write_base_files(dir: &Path) {
        write_file(dir, ENTITIES_FILE, "e0\ne1\ne2\ne3\n");
        write_file(dir, RELATIONS_FILE, "r0\nr1\n");
        write_file(dir, TRAIN_FILE, "0 0 1\n0 0 2\n3 1 0\n");
        write_file(dir, TEST_FILE, "0 0 3\n");
    }

    #[test]
    fn test_load_derives_missing_indexes() {
        let dir = TempDir::new().unwrap();
        write_base_files(dir.path());

        let ds = KgDataset::load(dir.path()).unwrap();
        assert_eq!(ds.num_entities(), 4);
        assert_eq!(ds.num_relations(), 2);
        assert_eq!(ds.relation_targets(0), Some(&[1, 2][..]));
        assert_eq!(ds.relation_targets(1), Some(&[0][..]));
        assert_eq!(ds.eval_true(0, 0), Some(&[3][..]));
        // Filter set covers eval truth plus historical train tails
        let filter = ds.filter_true(0, 0).unwrap();
        assert!(filter.contains(&1) && filter.contains(&2) && filter.contains(&3));
        assert!(ds.is_known_positive(0, 0, 1));
        assert!(!ds.is_known_positive(0, 0, 3));
    }

    #[test]
    fn test_explicit_index_files_win_over_derivation() {
        let dir = TempDir::new().unwrap();
        write_base_files(dir.path());
        write_file(dir.path(), "relation_targets.idx", "0\n");
        write_file(dir.path(), "relation_targets.values", "1 2 3\n");

        let ds = KgDataset::load(dir.path()).unwrap();
        assert_eq!(ds.relation_targets(0), Some(&[1, 2, 3][..]));
        // Relation 1 is absent from the explicit index
        assert_eq!(ds.relation_targets(1), None);
    }

    #[test]
    fn test_avoided_entities_leave_candidate_pools() {
        let dir = TempDir::new().unwrap();
        write_base_files(dir.path());
        write_file(dir.path(), AVOID_FILE, "2\n");

        let ds = KgDataset::load(dir.path()).unwrap();
        assert_eq!(ds.relation_targets(0), Some(&[1][..]));
        assert!(ds.avoid().contains(&2));
    }

    #[test]
    fn test_out_of_range_triple_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), ENTITIES_FILE, "e0\n");
        write_file(dir.path(), RELATIONS_FILE, "r0\n");
        write_file(dir.path(), TRAIN_FILE, "0 0 7\n");
        write_file(dir.path(), TEST_FILE, "");

        let err = KgDataset::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_index_pair_length_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_base_files(dir.path());
        write_file(dir.path(), "eval_true.idx", "0 0\n0 1\n");
        write_file(dir.path(), "eval_true.values", "3\n");

        let err = KgDataset::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("keys but"));
    }

    #[test]
    fn test_query_helpers() {
        let ds = KgDataset::from_triples(
            vec!["a".into(), "b".into(), "c".into()],
            vec!["r".into(), "s".into()],
            vec![Triple::new(0, 0, 1)],
            vec![
                Triple::new(0, 0, 1),
                Triple::new(2, 0, 1),
                Triple::new(0, 1, 2),
            ],
        );
        assert_eq!(ds.test_relations(), vec![0, 1]);
        assert_eq!(ds.query_heads(0), vec![0, 2]);
        assert_eq!(ds.query_heads(1), vec![0]);
    }
}
