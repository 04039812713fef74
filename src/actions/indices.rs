//! Index creation and deletion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::name_violation;
use crate::error::{MeridianError, Result};
use crate::master::{Task, TaskContext};
use crate::state::{AliasMetadata, ClusterState, IndexMetadata};
use crate::types::Priority;

/// Parameters of a new index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIndexRequest {
    pub name: String,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CreateIndexRequest {
    pub fn new(name: impl Into<String>, number_of_shards: u32, number_of_replicas: u32) -> Self {
        Self {
            name: name.into(),
            number_of_shards,
            number_of_replicas,
            settings: BTreeMap::new(),
            mapping: BTreeMap::new(),
            aliases: Vec::new(),
        }
    }
}

pub fn validate_index_name(state: &ClusterState, name: &str) -> Result<()> {
    if let Some(reason) = name_violation(name) {
        return Err(MeridianError::InvalidIndexName {
            name: name.to_string(),
            reason,
        });
    }
    if state.metadata.has_index(name) {
        return Err(MeridianError::IndexAlreadyExists(name.to_string()));
    }
    if state.metadata.has_alias(name) {
        return Err(MeridianError::InvalidIndexName {
            name: name.to_string(),
            reason: "an alias with the same name already exists".to_string(),
        });
    }
    Ok(())
}

/// Add index metadata and unassigned routing entries.
pub fn create_index(state: &ClusterState, request: &CreateIndexRequest, now_millis: u64) -> Result<ClusterState> {
    validate_index_name(state, &request.name)?;
    if request.number_of_shards == 0 {
        return Err(MeridianError::Validation(
            "index must have at least one shard".to_string(),
        ));
    }

    let mut meta = IndexMetadata::new(
        request.name.clone(),
        request.number_of_shards,
        request.number_of_replicas,
    );
    meta.created_at_millis = now_millis;
    meta.settings = request.settings.clone();
    meta.mapping.merge(&request.mapping)?;
    for alias in &request.aliases {
        super::aliases::validate_alias_name(state, alias)?;
        if alias == &request.name {
            return Err(MeridianError::InvalidAliasName {
                name: alias.clone(),
                reason: "an index exists with the same name as the alias".to_string(),
            });
        }
        meta.aliases.insert(alias.clone(), AliasMetadata::new(alias.clone()));
    }

    let mut next = state.clone();
    next.routing_table.add_index(&meta, now_millis);
    next.metadata.indices.insert(meta.name.clone(), meta);
    Ok(next)
}

/// Remove index metadata and every routing entry of the index.
pub fn delete_index(state: &ClusterState, name: &str) -> Result<ClusterState> {
    if !state.metadata.has_index(name) {
        return Err(MeridianError::IndexNotFound(name.to_string()));
    }
    let mut next = state.clone();
    next.metadata.indices.remove(name);
    next.routing_table.remove_index(name);
    Ok(next)
}

pub fn create_index_task(request: CreateIndexRequest) -> Task {
    Task::new(
        format!("create-index [{}]", request.name),
        Priority::Urgent,
        move |state: &ClusterState, ctx: &TaskContext| create_index(state, &request, ctx.now_millis()),
    )
    .with_reroute()
}

pub fn delete_index_task(name: impl Into<String>) -> Task {
    let name = name.into();
    Task::new(
        format!("delete-index [{}]", name),
        Priority::Urgent,
        move |state: &ClusterState, _: &TaskContext| delete_index(state, &name),
    )
    .with_reroute()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DiscoveryNode, ShardRoutingState};
    use crate::types::ShardId;

    fn state() -> ClusterState {
        ClusterState::bootstrap("test", DiscoveryNode::new("node-1", "127.0.0.1:9300"))
    }

    #[test]
    fn test_create_index() {
        let mut request = CreateIndexRequest::new("logs", 2, 1);
        request.mapping.insert("message".into(), "text".into());
        request.aliases.push("all-logs".into());

        let next = create_index(&state(), &request, 42).unwrap();
        let meta = next.index("logs").unwrap();
        assert_eq!(meta.created_at_millis, 42);
        assert_eq!(meta.mapping.fields.get("message").map(String::as_str), Some("text"));
        assert!(next.metadata.has_alias("all-logs"));

        let copies = next.routing_table.copies(&ShardId::new("logs", 1)).unwrap();
        assert_eq!(copies.len(), 2);
        assert!(copies.iter().all(|c| c.state == ShardRoutingState::Unassigned));
    }

    #[test]
    fn test_create_existing_index_fails() {
        let next = create_index(&state(), &CreateIndexRequest::new("logs", 1, 0), 0).unwrap();
        let err = create_index(&next, &CreateIndexRequest::new("logs", 1, 0), 0).unwrap_err();
        assert!(matches!(err, MeridianError::IndexAlreadyExists(_)));
    }

    #[test]
    fn test_index_name_colliding_with_alias() {
        let mut request = CreateIndexRequest::new("logs-1", 1, 0);
        request.aliases.push("logs".into());
        let next = create_index(&state(), &request, 0).unwrap();

        let err = create_index(&next, &CreateIndexRequest::new("logs", 1, 0), 0).unwrap_err();
        assert!(matches!(err, MeridianError::InvalidIndexName { .. }));
    }

    #[test]
    fn test_delete_index() {
        let next = create_index(&state(), &CreateIndexRequest::new("logs", 1, 0), 0).unwrap();
        let next = delete_index(&next, "logs").unwrap();
        assert!(next.index("logs").is_none());
        assert!(next.routing_table.indices.is_empty());
        assert!(matches!(
            delete_index(&next, "logs"),
            Err(MeridianError::IndexNotFound(_))
        ));
    }
}
