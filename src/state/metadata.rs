//! Index metadata: settings, shard counts, aliases and field mappings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MeridianError, Result};

/// Cluster-wide index metadata keyed by index name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub indices: BTreeMap<String, IndexMetadata>,
}

impl Metadata {
    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    /// Whether any index carries an alias called `alias`.
    pub fn has_alias(&self, alias: &str) -> bool {
        self.indices.values().any(|i| i.aliases.contains_key(alias))
    }

    /// Names of the indices an alias points to, in name order.
    pub fn alias_indices(&self, alias: &str) -> Vec<&str> {
        self.indices
            .values()
            .filter(|i| i.aliases.contains_key(alias))
            .map(|i| i.name.as_str())
            .collect()
    }

    pub fn index_mut(&mut self, name: &str) -> Result<&mut IndexMetadata> {
        self.indices
            .get_mut(name)
            .ok_or_else(|| MeridianError::IndexNotFound(name.to_string()))
    }
}

/// Metadata of a single index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    /// Creation time read from the task clock.
    pub created_at_millis: u64,
    pub settings: BTreeMap<String, String>,
    pub aliases: BTreeMap<String, AliasMetadata>,
    pub mapping: Mapping,
}

impl IndexMetadata {
    pub fn new(name: impl Into<String>, number_of_shards: u32, number_of_replicas: u32) -> Self {
        Self {
            name: name.into(),
            number_of_shards,
            number_of_replicas,
            created_at_millis: 0,
            settings: BTreeMap::new(),
            aliases: BTreeMap::new(),
            mapping: Mapping::default(),
        }
    }

    /// Copies per shard: one primary plus its replicas.
    pub fn copies_per_shard(&self) -> u32 {
        1 + self.number_of_replicas
    }
}

/// An alias pointing at an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasMetadata {
    pub alias: String,
    pub filter: Option<String>,
    pub index_routing: Option<String>,
    pub search_routing: Option<String>,
    pub is_write_index: Option<bool>,
}

impl AliasMetadata {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            filter: None,
            index_routing: None,
            search_routing: None,
            is_write_index: None,
        }
    }
}

/// Field name to field type mapping of an index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub fields: BTreeMap<String, String>,
    /// Bumped every time the mapping changes.
    pub version: u64,
}

impl Mapping {
    /// Fields of `requested` that this mapping does not know yet.
    pub fn missing_fields(&self, requested: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        requested
            .iter()
            .filter(|(name, _)| !self.fields.contains_key(*name))
            .map(|(name, ty)| (name.clone(), ty.clone()))
            .collect()
    }

    /// Whether every requested field is mapped with the requested type.
    pub fn contains_all(&self, requested: &BTreeMap<String, String>) -> bool {
        requested
            .iter()
            .all(|(name, ty)| self.fields.get(name) == Some(ty))
    }

    /// Merge `update` into the mapping. Returns whether anything changed.
    ///
    /// Nothing is merged if one of the fields is already mapped with a
    /// different type.
    pub fn merge(&mut self, update: &BTreeMap<String, String>) -> Result<bool> {
        for (name, ty) in update {
            if let Some(existing) = self.fields.get(name) {
                if existing != ty {
                    return Err(MeridianError::MappingConflict {
                        field: name.clone(),
                        existing: existing.clone(),
                        requested: ty.clone(),
                    });
                }
            }
        }

        let missing = self.missing_fields(update);
        if missing.is_empty() {
            return Ok(false);
        }
        self.fields.extend(missing);
        self.version += 1;
        Ok(true)
    }
}
