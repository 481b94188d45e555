// Cross-Instance Directory
//
// Shared registry of which users hold at least one live connection anywhere
// in the fleet. Writes are idempotent and best-effort; there is no
// cross-instance locking, races are absorbed by the presence debounce windows.

use async_trait::async_trait;
use beacon_core::Result;
use std::collections::{BTreeSet, HashSet};

#[async_trait]
pub trait Directory: Send + Sync {
    /// Add `connection_id` to the user's set. Re-adding is a no-op.
    async fn mark_online(&self, user_id: &str, connection_id: &str) -> Result<()>;

    /// Remove the user's entry entirely
    async fn mark_offline(&self, user_id: &str) -> Result<()>;

    /// Remove one connection; the entry is deleted with its last connection
    async fn mark_offline_connection(&self, user_id: &str, connection_id: &str) -> Result<()>;

    /// Snapshot of every user with an entry
    async fn list_online_user_ids(&self) -> Result<HashSet<String>>;

    async fn is_online(&self, user_id: &str) -> Result<bool>;

    async fn connections_for(&self, user_id: &str) -> Result<BTreeSet<String>>;
}

/// Members of `candidates` that are online, in candidate order, without duplicates
pub async fn online_subset(directory: &dyn Directory, candidates: &[String]) -> Result<Vec<String>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let online = directory.list_online_user_ids().await?;
    let mut seen = HashSet::new();
    Ok(candidates
        .iter()
        .filter(|id| online.contains(id.as_str()) && seen.insert(id.as_str()))
        .cloned()
        .collect())
}

/// Decode the JSON array of connection ids stored per user.
///
/// Unreadable values decode to an empty set so a single corrupt entry cannot
/// wedge presence for that user; the next write replaces it.
pub(crate) fn decode_connection_ids(user_id: &str, raw: Option<&str>) -> BTreeSet<String> {
    let Some(raw) = raw else {
        return BTreeSet::new();
    };
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(ids) => ids.into_iter().collect(),
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Discarding unreadable directory entry");
            BTreeSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryDirectory;

    #[test]
    fn test_decode_connection_ids() {
        let ids = decode_connection_ids("u1", Some(r#"["b","a","a"]"#));
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("a"));
        assert!(decode_connection_ids("u1", None).is_empty());
        assert!(decode_connection_ids("u1", Some("not-json")).is_empty());
    }

    #[tokio::test]
    async fn test_online_subset_keeps_order_and_dedups() {
        let directory = MemoryDirectory::new();
        directory.mark_online("b", "c-b").await.unwrap();
        directory.mark_online("d", "c-d").await.unwrap();

        let candidates = vec![
            "d".to_string(),
            "a".to_string(),
            "b".to_string(),
            "d".to_string(),
        ];
        let online = online_subset(&directory, &candidates).await.unwrap();
        assert_eq!(online, vec!["d".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_online_subset_empty_candidates() {
        let directory = MemoryDirectory::new();
        directory.mark_online("b", "c-b").await.unwrap();
        assert!(online_subset(&directory, &[]).await.unwrap().is_empty());
    }
}
