//! CollectionRelation - lazy-loaded collection of related records

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::RelationConfig;
use crate::error::RelationResult;
use crate::record::Record;

use super::flight::{CollectionOutcome, Flight};

/// Fetch function for a related collection, given the parent record
pub type CollectionFetcher<P, C, V> =
    Box<dyn Fn(&C, &P) -> BoxFuture<'static, CollectionOutcome<V>> + Send + Sync>;

/// Cached collection shared with callers
pub type Items<V> = Arc<Vec<Arc<V>>>;

struct CollectionState<V: Record> {
    items: Option<Items<V>>,
    flight: Flight<CollectionOutcome<V>>,
}

impl<V: Record> CollectionState<V> {
    fn store(&mut self, items: Items<V>) {
        self.items = Some(items);
        self.flight.reset();
    }

    fn clear(&mut self) {
        self.items = None;
        self.flight.reset();
    }
}

/// Lazy-loaded, single-flight cache for the records related to a parent
///
/// The collection is fetched once through a function of the parent record
/// and then kept coherent through [`append_item`](Self::append_item) and
/// [`remove_item`](Self::remove_item). Callers get the cached sequence as a
/// shared [`Items`] handle; mutations copy on write, so a handle obtained
/// before a mutation keeps its snapshot.
pub struct CollectionRelation<P, V: Record, C> {
    config: RelationConfig,
    fetch: CollectionFetcher<P, C, V>,
    state: Mutex<CollectionState<V>>,
}

impl<P: 'static, V: Record, C: 'static> CollectionRelation<P, V, C> {
    pub fn new<F, Fut, I>(fetch: F) -> Self
    where
        F: Fn(&C, &P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RelationResult<I>> + Send + 'static,
        I: IntoIterator + 'static,
        I::Item: Into<Arc<V>>,
    {
        Self::with_config(RelationConfig::default(), fetch)
    }

    pub fn with_config<F, Fut, I>(config: RelationConfig, fetch: F) -> Self
    where
        F: Fn(&C, &P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RelationResult<I>> + Send + 'static,
        I: IntoIterator + 'static,
        I::Item: Into<Arc<V>>,
    {
        let fetch: CollectionFetcher<P, C, V> = Box::new(move |ctx: &C, parent: &P| {
            fetch(ctx, parent)
                .map(|outcome| {
                    outcome.map(|items| {
                        Arc::new(items.into_iter().map(Into::into).collect::<Vec<Arc<V>>>())
                    })
                })
                .boxed()
        });

        Self {
            config,
            fetch,
            state: Mutex::new(CollectionState {
                items: None,
                flight: Flight::new(),
            }),
        }
    }
}

impl<P, V: Record, C> CollectionRelation<P, V, C> {
    pub fn config(&self) -> &RelationConfig {
        &self.config
    }

    /// Cached collection, `None` until loaded
    pub fn items(&self) -> Option<Items<V>> {
        self.state.lock().items.clone()
    }

    /// Whether the collection is cached; an empty collection counts as loaded
    pub fn loaded(&self) -> bool {
        self.state.lock().items.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().flight.is_pending()
    }

    /// Number of cached records, `None` until loaded
    pub fn len(&self) -> Option<usize> {
        self.state.lock().items.as_ref().map(|items| items.len())
    }

    /// Return the cached collection, start the fetch, or await the fetch in flight
    ///
    /// The returned handle is a snapshot: [`append_item`](Self::append_item)
    /// and [`remove_item`](Self::remove_item) copy the cached sequence before
    /// changing it, so a handle taken earlier does not see later mutations.
    /// Call `get_items` or [`items`](Self::items) again for the current view.
    ///
    /// The fetch function runs without the relation lock held, so it may
    /// inspect `parent`, including this relation.
    pub async fn get_items(&self, ctx: &C, parent: &P) -> RelationResult<Items<V>> {
        let joined = {
            let state = self.state.lock();
            if let Some(items) = &state.items {
                return Ok(Arc::clone(items));
            }
            state.flight.join().ok_or(state.flight.epoch())
        };

        let ticket = match joined {
            Ok(ticket) => ticket,
            Err(epoch) => {
                debug!(record_type = V::TYPE_NAME, "fetching related collection");
                let fetch = (self.fetch)(ctx, parent);
                self.state.lock().flight.start(epoch, fetch)
            }
        };

        let outcome = ticket.fetch.await;

        let mut state = self.state.lock();
        if state.flight.is_current(ticket.epoch) {
            match &outcome {
                Ok(items) => state.items = Some(Arc::clone(items)),
                Err(_) if self.config.resets_failures() => state.flight.reset(),
                Err(_) => {}
            }
        }
        outcome
    }

    /// Append `item` if the collection is cached
    ///
    /// Returns whether the cache changed.
    pub fn append_item(&self, item: impl Into<Arc<V>>) -> bool {
        let mut state = self.state.lock();
        match state.items.as_mut() {
            Some(items) => {
                Arc::make_mut(items).push(item.into());
                true
            }
            None => {
                debug!(record_type = V::TYPE_NAME, "ignoring append to unloaded collection");
                false
            }
        }
    }

    /// Remove the first cached record with the same key as `item`
    ///
    /// Returns whether a record was removed.
    pub fn remove_item(&self, item: &V) -> bool {
        let key = item.key();
        let mut state = self.state.lock();
        let Some(items) = state.items.as_mut() else {
            debug!(record_type = V::TYPE_NAME, key = ?key, "ignoring remove from unloaded collection");
            return false;
        };

        match items.iter().position(|cached| cached.key() == key) {
            Some(index) => {
                Arc::make_mut(items).remove(index);
                true
            }
            None => false,
        }
    }

    /// Replace the cached collection, marking it loaded without fetching
    pub fn set_collection<I>(&self, items: I)
    where
        I: IntoIterator,
        I::Item: Into<Arc<V>>,
    {
        let items: Vec<Arc<V>> = items.into_iter().map(Into::into).collect();
        self.state.lock().store(Arc::new(items));
    }

    /// Drop the cached collection and any fetch in flight
    pub fn clear(&self) {
        self.state.lock().clear();
    }
}

impl<P, V: Record, C> fmt::Debug for CollectionRelation<P, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionRelation")
            .field("record_type", &V::TYPE_NAME)
            .field("len", &self.len())
            .finish()
    }
}
