//! Alias add/remove actions.

use serde::{Deserialize, Serialize};

use super::name_violation;
use crate::error::{MeridianError, Result};
use crate::master::{Task, TaskContext};
use crate::state::{AliasMetadata, ClusterState};
use crate::types::Priority;

/// A single alias change. All actions of a task apply atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AliasAction {
    Add {
        index: String,
        alias: String,
        filter: Option<String>,
        is_write_index: Option<bool>,
    },
    Remove {
        index: String,
        alias: String,
    },
}

impl AliasAction {
    pub fn add(index: impl Into<String>, alias: impl Into<String>) -> Self {
        AliasAction::Add {
            index: index.into(),
            alias: alias.into(),
            filter: None,
            is_write_index: None,
        }
    }

    pub fn remove(index: impl Into<String>, alias: impl Into<String>) -> Self {
        AliasAction::Remove {
            index: index.into(),
            alias: alias.into(),
        }
    }
}

/// Check an alias name against the naming rules and the existing indices.
pub fn validate_alias_name(state: &ClusterState, alias: &str) -> Result<()> {
    if let Some(reason) = name_violation(alias) {
        return Err(MeridianError::InvalidAliasName {
            name: alias.to_string(),
            reason,
        });
    }
    if state.metadata.has_index(alias) {
        return Err(MeridianError::InvalidAliasName {
            name: alias.to_string(),
            reason: "an index exists with the same name as the alias".to_string(),
        });
    }
    Ok(())
}

/// Apply alias actions in order on a copy of `state`.
pub fn apply_alias_actions(state: &ClusterState, actions: &[AliasAction]) -> Result<ClusterState> {
    if actions.is_empty() {
        return Err(MeridianError::Validation("no alias actions given".to_string()));
    }

    let mut next = state.clone();
    for action in actions {
        match action {
            AliasAction::Add {
                index,
                alias,
                filter,
                is_write_index,
            } => {
                validate_alias_name(&next, alias)?;
                let meta = next.metadata.index_mut(index)?;
                let mut alias_meta = AliasMetadata::new(alias.clone());
                alias_meta.filter = filter.clone();
                alias_meta.is_write_index = *is_write_index;
                meta.aliases.insert(alias.clone(), alias_meta);
            }
            AliasAction::Remove { index, alias } => {
                let meta = next.metadata.index_mut(index)?;
                if meta.aliases.remove(alias).is_none() {
                    return Err(MeridianError::Validation(format!(
                        "alias [{}] is missing on index [{}]",
                        alias, index
                    )));
                }
            }
        }
    }

    check_single_write_index(&next, actions)?;
    Ok(next)
}

fn check_single_write_index(state: &ClusterState, actions: &[AliasAction]) -> Result<()> {
    for action in actions {
        if let AliasAction::Add { alias, .. } = action {
            let writers = state
                .metadata
                .indices
                .values()
                .filter(|i| {
                    i.aliases
                        .get(alias)
                        .and_then(|a| a.is_write_index)
                        .unwrap_or(false)
                })
                .count();
            if writers > 1 {
                return Err(MeridianError::Validation(format!(
                    "alias [{}] has more than one write index",
                    alias
                )));
            }
        }
    }
    Ok(())
}

/// Task applying `actions` atomically.
pub fn index_aliases_task(actions: Vec<AliasAction>) -> Task {
    Task::new(
        "index-aliases",
        Priority::Urgent,
        move |state: &ClusterState, _: &TaskContext| apply_alias_actions(state, &actions),
    )
}
