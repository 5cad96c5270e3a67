//! Shared bookkeeping for embedding model implementations

use crate::{ModelConfig, Triple};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Identity, vocabulary maps, and triple storage common to models
#[derive(Debug, Clone)]
pub struct BaseModel {
    pub config: ModelConfig,
    pub model_id: Uuid,
    pub entity_names: Vec<String>,
    pub relation_names: Vec<String>,
    pub entity_to_id: HashMap<String, usize>,
    pub relation_to_id: HashMap<String, usize>,
    pub triples: Vec<Triple>,
    pub positive_triples: HashSet<(usize, usize, usize)>,
    pub is_trained: bool,
    pub creation_time: DateTime<Utc>,
    pub last_training_time: Option<DateTime<Utc>>,
    pub global_step: u64,
}

impl BaseModel {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            model_id: Uuid::new_v4(),
            entity_names: Vec::new(),
            relation_names: Vec::new(),
            entity_to_id: HashMap::new(),
            relation_to_id: HashMap::new(),
            triples: Vec::new(),
            positive_triples: HashSet::new(),
            is_trained: false,
            creation_time: Utc::now(),
            last_training_time: None,
            global_step: 0,
        }
    }

    /// Install the fixed name tables. Ids are the table positions.
    pub fn set_vocabulary(&mut self, entity_names: Vec<String>, relation_names: Vec<String>) {
        self.entity_to_id = entity_names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();
        self.relation_to_id = relation_names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();
        self.entity_names = entity_names;
        self.relation_names = relation_names;
    }

    pub fn num_entities(&self) -> usize {
        self.entity_names.len()
    }

    pub fn num_relations(&self) -> usize {
        self.relation_names.len()
    }

    pub fn entity_id(&self, name: &str) -> Option<usize> {
        self.entity_to_id.get(name).copied()
    }

    pub fn relation_id(&self, name: &str) -> Option<usize> {
        self.relation_to_id.get(name).copied()
    }

    pub fn entity_name(&self, id: usize) -> Option<&str> {
        self.entity_names.get(id).map(|s| s.as_str())
    }

    pub fn relation_name(&self, id: usize) -> Option<&str> {
        self.relation_names.get(id).map(|s| s.as_str())
    }

    /// Register a training triple; ids must fall inside the name tables
    pub fn add_triple(&mut self, triple: Triple) -> Result<()> {
        if triple.head >= self.num_entities() || triple.tail >= self.num_entities() {
            return Err(anyhow!(
                "triple ({}, {}, {}) references an unknown entity (have {})",
                triple.head,
                triple.relation,
                triple.tail,
                self.num_entities()
            ));
        }
        if triple.relation >= self.num_relations() {
            return Err(anyhow!(
                "triple ({}, {}, {}) references an unknown relation (have {})",
                triple.head,
                triple.relation,
                triple.tail,
                self.num_relations()
            ));
        }
        self.triples.push(triple);
        self.positive_triples
            .insert((triple.head, triple.relation, triple.tail));
        Ok(())
    }

    pub fn is_positive(&self, head: usize, relation: usize, tail: usize) -> bool {
        self.positive_triples.contains(&(head, relation, tail))
    }

    pub fn clear(&mut self) {
        self.triples.clear();
        self.positive_triples.clear();
        self.is_trained = false;
        self.global_step = 0;
    }
}
