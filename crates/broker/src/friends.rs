// Friend directory lookup
//
// The friend-relationship store is an external service reached through the
// correlation client. Callers only see Some(list) or None ("unknown").

use crate::rpc::{BrokerEnvelope, CorrelationClient};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub const GET_FRIEND_LIST: &str = "GET_FRIEND_LIST";

#[async_trait]
pub trait FriendLookup: Send + Sync {
    /// The user's friend ids, or None when the list could not be determined
    async fn friends_of(&self, user_id: &str) -> Option<Vec<String>>;
}

pub struct FriendDirectoryClient {
    rpc: Arc<CorrelationClient>,
    topic: String,
}

impl FriendDirectoryClient {
    pub fn new(rpc: Arc<CorrelationClient>, topic: impl Into<String>) -> Self {
        Self {
            rpc,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl FriendLookup for FriendDirectoryClient {
    async fn friends_of(&self, user_id: &str) -> Option<Vec<String>> {
        let response = match self
            .rpc
            .request(&self.topic, GET_FRIEND_LIST, user_id, json!({ "userId": user_id }))
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return None,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Friend list lookup failed");
                return None;
            }
        };

        let friends = parse_friend_list(&response);
        if friends.is_none() {
            tracing::warn!(
                user_id,
                request_id = %response.request_id,
                "Friend list response has no friend list"
            );
        }
        friends
    }
}

/// Extract friend ids from a GET_FRIEND_LIST response.
///
/// Looks for `friends` or `friendList` at the top level, then inside `data`,
/// then accepts `data` itself as the list. Entries are ids or objects with
/// `uuid`/`userId`.
pub fn parse_friend_list(envelope: &BrokerEnvelope) -> Option<Vec<String>> {
    let candidates = [
        envelope.extra.get("friends"),
        envelope.extra.get("friendList"),
        envelope.data.get("friends"),
        envelope.data.get("friendList"),
        Some(&envelope.data),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(|value| value.as_array())
        .map(|items| items.iter().filter_map(friend_id).collect())
}

fn friend_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(id) => Some(id.clone()),
        JsonValue::Object(fields) => fields
            .get("uuid")
            .or_else(|| fields.get("userId"))
            .and_then(|id| id.as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// Fixed friend lists held in memory. Users without an entry are unknown.
#[derive(Default)]
pub struct StaticFriends {
    lists: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticFriends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: impl Into<String>, friends: &[&str]) {
        let friends = friends.iter().map(|f| f.to_string()).collect();
        self.lists
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user_id.into(), friends);
    }
}

#[async_trait]
impl FriendLookup for StaticFriends {
    async fn friends_of(&self, user_id: &str) -> Option<Vec<String>> {
        self.lists
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(user_id)
            .cloned()
    }
}
