//! The post store: the single owner of the timeline.
//!
//! All mutations go through `&mut PostStore`. Enrichment runs in background
//! tasks that only report back through the completion queue; results are
//! applied by whoever owns the store via [`PostStore::apply_pending`],
//! [`PostStore::next_completion`] or [`PostStore::settle`]. Every applied
//! result is re-checked against the current state of its post first.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::enrich::{CompletionQueue, Enricher, EnrichmentOutcome, EnrichmentTask};
use crate::links;
use crate::search::{self, SearchResults};
use crate::storage::KeyValueStore;

mod persist;
mod post;

pub use persist::{decode, encode, load, save, SAVE_KEY};
pub use post::{LinkMetadata, Post, PostId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("post content cannot be empty")]
    EmptyContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Updated,
    NotFound,
}

/// What happened to an enrichment result once it reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchDecision {
    Applied,
    /// The lookup produced no metadata.
    Failed,
    /// The post was deleted while the lookup ran.
    PostMissing,
    /// The post was edited again after this lookup was requested.
    Superseded,
    /// The link no longer appears in the post.
    UrlGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created(PostId),
    Edited(PostId),
    Deleted(PostId),
    MetadataAttached(PostId),
}

/// Sent to subscribers after every mutation, with the timeline as it stands.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub change: ChangeKind,
    pub posts: Arc<Vec<Post>>,
}

struct InFlight {
    post_id: PostId,
    task: EnrichmentTask,
}

pub struct PostStore<S> {
    posts: Vec<Post>,
    storage: S,
    enrichment: Option<(Enricher, CompletionQueue)>,
    in_flight: HashMap<u64, InFlight>,
    tickets: HashMap<PostId, u64>,
    next_ticket: u64,
    subscribers: Vec<Sender<StoreEvent>>,
}

impl<S: KeyValueStore> PostStore<S> {
    /// Restores the saved timeline from `storage`. Nothing is fetched for
    /// links until an enricher is attached.
    pub fn open(storage: S) -> Self {
        let posts = persist::load(&storage);
        tracing::debug!(posts = posts.len(), "post store opened");
        Self {
            posts,
            storage,
            enrichment: None,
            in_flight: HashMap::new(),
            tickets: HashMap::new(),
            next_ticket: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn with_enrichment(mut self, enricher: Enricher, completions: CompletionQueue) -> Self {
        self.enrichment = Some((enricher, completions));
        self
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn get(&self, id: PostId) -> Option<&Post> {
        self.posts.iter().find(|post| post.id == id)
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Number of enrichment results not yet applied.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn subscribe(&mut self) -> Receiver<StoreEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn search(&self, query: &str) -> SearchResults<'_> {
        search::search(&self.posts, query)
    }

    pub fn create(&mut self, text: &str) -> Result<PostId, StoreError> {
        if text.trim().is_empty() {
            return Err(StoreError::EmptyContent);
        }
        let post = Post::new(text.to_string());
        let id = post.id;
        self.posts.insert(0, post);
        self.persist();
        tracing::info!(post_id = %id, "post created");
        self.request_enrichment(id, text);
        self.emit(ChangeKind::Created(id));
        Ok(id)
    }

    /// Replaces a post's content. Link metadata is always dropped and looked
    /// up again, even when the link itself did not change.
    pub fn edit(&mut self, id: PostId, new_text: &str) -> Result<EditOutcome, StoreError> {
        if new_text.trim().is_empty() {
            return Err(StoreError::EmptyContent);
        }
        let Some(post) = self.posts.iter_mut().find(|post| post.id == id) else {
            tracing::debug!(post_id = %id, "edit ignored, post not found");
            return Ok(EditOutcome::NotFound);
        };
        post.content = new_text.to_string();
        post.link_metadata = None;
        self.persist();
        tracing::info!(post_id = %id, "post edited");
        self.request_enrichment(id, new_text);
        self.emit(ChangeKind::Edited(id));
        Ok(EditOutcome::Updated)
    }

    /// Removes a post. Returns `false` when there was nothing to remove.
    pub fn delete(&mut self, id: PostId) -> bool {
        let before = self.posts.len();
        self.posts.retain(|post| post.id != id);
        if self.posts.len() == before {
            tracing::debug!(post_id = %id, "delete ignored, post not found");
            return false;
        }
        self.tickets.remove(&id);
        self.persist();
        tracing::info!(post_id = %id, "post deleted");
        self.emit(ChangeKind::Deleted(id));
        true
    }

    /// Applies every enrichment result that has already arrived, without
    /// waiting. Returns how many were handled.
    pub fn apply_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(outcome) = self.ready_outcome() {
            self.apply_outcome(outcome);
            handled += 1;
        }
        handled
    }

    /// Waits for the next enrichment result and applies it. Returns `None`
    /// when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<PatchDecision> {
        if self.in_flight.is_empty() {
            return None;
        }
        let (_, completions) = self.enrichment.as_mut()?;
        let outcome = completions.next().await?;
        Some(self.apply_outcome(outcome))
    }

    /// Waits until every requested enrichment has reported back.
    pub async fn settle(&mut self) -> usize {
        let mut handled = 0;
        while self.next_completion().await.is_some() {
            handled += 1;
        }
        handled
    }

    fn ready_outcome(&mut self) -> Option<EnrichmentOutcome> {
        self.enrichment
            .as_mut()
            .and_then(|(_, completions)| completions.try_next())
    }

    fn request_enrichment(&mut self, id: PostId, text: &str) {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.tickets.insert(id, ticket);

        let Some((enricher, _)) = self.enrichment.as_ref() else {
            return;
        };
        let Some(link) = links::extract_first_url(text) else {
            return;
        };
        tracing::debug!(post_id = %id, ticket, url = %link.url(), "requesting link preview");
        let task = enricher.spawn(id, ticket, link.into_url());
        self.in_flight.insert(
            ticket,
            InFlight {
                post_id: id,
                task,
            },
        );
    }

    pub(crate) fn apply_outcome(&mut self, outcome: EnrichmentOutcome) -> PatchDecision {
        if let Some(task) = self.in_flight.remove(&outcome.ticket) {
            debug_assert_eq!(task.post_id, outcome.post_id);
        }
        let post_id = outcome.post_id;
        let ticket = outcome.ticket;
        let decision = self.patch(outcome);
        match decision {
            PatchDecision::Applied => {
                tracing::info!(%post_id, ticket, "link preview attached")
            }
            PatchDecision::Failed => {
                tracing::debug!(%post_id, ticket, "no link preview available")
            }
            other => {
                tracing::debug!(%post_id, ticket, decision = ?other, "discarding stale link preview")
            }
        }
        decision
    }

    fn patch(&mut self, outcome: EnrichmentOutcome) -> PatchDecision {
        let Some(index) = self.posts.iter().position(|post| post.id == outcome.post_id) else {
            return PatchDecision::PostMissing;
        };
        if self.tickets.get(&outcome.post_id) != Some(&outcome.ticket) {
            return PatchDecision::Superseded;
        }
        let Some(metadata) = outcome.metadata else {
            return PatchDecision::Failed;
        };
        if !links::contains_url(&self.posts[index].content, &outcome.link) {
            return PatchDecision::UrlGone;
        }
        self.posts[index].link_metadata = Some(metadata);
        self.persist();
        self.emit(ChangeKind::MetadataAttached(outcome.post_id));
        PatchDecision::Applied
    }

    fn persist(&self) {
        persist::save(&self.storage, &self.posts);
    }

    fn emit(&mut self, change: ChangeKind) {
        if self.subscribers.is_empty() {
            return;
        }
        let event = StoreEvent {
            change,
            posts: Arc::new(self.posts.clone()),
        };
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

impl<S> Drop for PostStore<S> {
    fn drop(&mut self) {
        for in_flight in self.in_flight.values() {
            in_flight.task.abort();
        }
    }
}
