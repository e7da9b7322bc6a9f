use anyhow::{Context, Result};

use super::Post;
use crate::storage::KeyValueStore;

/// Key the whole timeline is stored under.
pub const SAVE_KEY: &str = "SavedScribs";

pub fn encode(posts: &[Post]) -> Result<Vec<u8>> {
    serde_json::to_vec(posts).context("serialising posts")
}

pub fn decode(payload: &[u8]) -> Result<Vec<Post>> {
    serde_json::from_slice(payload).context("parsing saved posts")
}

/// Overwrites the saved timeline. Failures are logged and swallowed; the
/// in-memory collection stays authoritative for the session.
pub fn save<S: KeyValueStore + ?Sized>(storage: &S, posts: &[Post]) -> bool {
    let result = encode(posts).and_then(|payload| storage.set(SAVE_KEY, &payload));
    match result {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), posts = posts.len(), "failed to persist posts");
            false
        }
    }
}

/// Reads the saved timeline, starting empty when nothing usable is stored.
pub fn load<S: KeyValueStore + ?Sized>(storage: &S) -> Vec<Post> {
    let payload = match storage.get(SAVE_KEY) {
        Ok(Some(payload)) => payload,
        Ok(None) => return Vec::new(),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "failed to read saved posts");
            return Vec::new();
        }
    };
    match decode(&payload) {
        Ok(posts) => posts,
        Err(err) => {
            tracing::warn!(
                error = %format!("{err:#}"),
                bytes = payload.len(),
                "discarding undecodable saved posts"
            );
            Vec::new()
        }
    }
}
