//! Cluster-state actions shipped with Meridian.
//!
//! Each action is a constructor returning a [`Task`](crate::master::Task)
//! whose transform validates its input against the current state and
//! returns the modified copy.
//!
//! | Action          | Topic           | Priority  | Reroute |
//! |-----------------|-----------------|-----------|---------|
//! | index-aliases   | `index-aliases` | Urgent    | no      |
//! | create-index    | `create-index`  | Urgent    | yes     |
//! | delete-index    | `delete-index`  | Urgent    | yes     |
//! | put-mapping     | `put-mapping`   | High      | no      |
//! | shard-started   | `shard-started` | Urgent    | yes     |
//! | shard-failed    | `shard-failed`  | High      | yes     |
//! | node-join       | `node-join`     | Urgent    | yes     |
//! | node-left       | `node-left`     | Immediate | yes     |
//! | move-shard      | `move-shard`    | Urgent    | no      |

pub mod aliases;
pub mod allocation;
pub mod indices;
pub mod mapping;
pub mod shard_state;

pub use aliases::{index_aliases_task, AliasAction};
pub use allocation::{AllocationService, MAX_ALLOCATION_ATTEMPTS};
pub use indices::{create_index_task, delete_index_task, CreateIndexRequest};
pub use mapping::{put_mapping_task, MappingUpdate, MappingUpdatePerformer, MasterMappingUpdater};
pub use shard_state::{
    move_shard_task, node_join_task, node_left_task, shard_failed_task, shard_started_task,
    MasterShardStateReporter,
};

const MAX_NAME_BYTES: usize = 255;
const INVALID_NAME_CHARS: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':'];

/// Rules shared by index and alias names. Returns the violated rule.
pub(crate) fn name_violation(name: &str) -> Option<String> {
    if name.is_empty() {
        return Some("must not be empty".to_string());
    }
    if name == "." || name == ".." {
        return Some("must not be '.' or '..'".to_string());
    }
    if name.starts_with(['_', '-', '+']) {
        return Some("must not start with '_', '-', or '+'".to_string());
    }
    if name.chars().any(char::is_uppercase) {
        return Some("must be lowercase".to_string());
    }
    if let Some(c) = name.chars().find(|c| INVALID_NAME_CHARS.contains(c)) {
        return Some(format!("must not contain '{}'", c));
    }
    if name.len() > MAX_NAME_BYTES {
        return Some(format!("must not be longer than {} bytes", MAX_NAME_BYTES));
    }
    None
}
