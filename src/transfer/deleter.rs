use crate::file::store::FileStore;
use crate::matching::mapper::FileNodeMapper;
use crate::node::registry::NodeRegistry;
use crate::transfer::error::TransferResult;
use crate::transfer::events::{Event, EventBus};
use crate::transfer::master::MasterRegistry;
use crate::transfer::transport::NodeTransport;
use std::sync::Arc;

/// Processes every file marked for deletion: asks each node holding it to
/// delete its copy, removes the master mapping, then hard-deletes locally.
///
/// A node that cannot be reached leaves the delete-pending flag set so a
/// later pass retries; a node that no longer knows the file counts as
/// deleted. Returns the number of files fully deleted.
#[allow(clippy::too_many_arguments)]
pub async fn run_pending_deletions(
    files: &FileStore,
    registry: &NodeRegistry,
    mapper: &FileNodeMapper,
    master: &Arc<dyn MasterRegistry>,
    transport: &Arc<dyn NodeTransport>,
    events: &EventBus,
    device_id: &str,
) -> TransferResult<usize> {
    let pending = files
        .files_for_deletion()
        .await
        .map_err(|e| crate::transfer::error::TransferError::MalformedReply(e.to_string()))?;

    let mut deleted = 0;
    'files: for file in pending {
        for node_id in &file.node_ids {
            let node = match registry.get(node_id) {
                Some(node) => node,
                // Stale node id; nothing to contact.
                None => continue,
            };
            if let Err(e) = transport.delete_file(&node, &file.id, device_id).await {
                tracing::warn!(file = %file.id, node = %node_id, error = %e, "remote delete failed, keeping flag");
                continue 'files;
            }
        }

        if !file.node_ids.is_empty() {
            if let Err(e) = master.delete_file_node_mapping(&file.id).await {
                tracing::warn!(file = %file.id, error = %e, "master mapping delete failed");
            }
        }

        mapper.remove(&file.id);
        if file.path.exists() {
            let _ = tokio::fs::remove_file(&file.path).await;
        }
        files
            .delete(&file.id)
            .await
            .map_err(|e| crate::transfer::error::TransferError::MalformedReply(e.to_string()))?;
        events.publish(Event::FileDeleted {
            file_id: file.id.clone(),
        });
        deleted += 1;
    }
    Ok(deleted)
}
