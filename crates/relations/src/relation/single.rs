//! SingleRelation - lazy-loaded reference to exactly one related record

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::RelationConfig;
use crate::error::{RelationError, RelationResult};
use crate::init::{init_value, init_value_or_same};
use crate::record::Record;

use super::flight::{ItemCell, ItemOutcome};

/// Fetch function for a single related record
pub type ItemFetcher<C, V> =
    Box<dyn Fn(&C, <V as Record>::Key) -> BoxFuture<'static, ItemOutcome<V>> + Send + Sync>;

struct SingleState<V: Record> {
    key: Option<V::Key>,
    cell: ItemCell<V>,
}

/// Lazy-loaded, single-flight cache for a required related record
///
/// The relation holds the foreign key of the owning record and, once
/// resolved, the related record itself. Concurrent calls to
/// [`get_item`](Self::get_item) share a single fetch.
pub struct SingleRelation<V: Record, C> {
    key_attr: String,
    config: RelationConfig,
    fetch: ItemFetcher<C, V>,
    state: Mutex<SingleState<V>>,
}

impl<V: Record, C: 'static> SingleRelation<V, C> {
    /// Create a new relation
    ///
    /// `key_attr` is the name of the key attribute on the owning record and
    /// is only used in error messages.
    pub fn new<F, Fut, R>(key_attr: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(&C, V::Key) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RelationResult<Option<R>>> + Send + 'static,
        R: Into<Arc<V>> + 'static,
    {
        Self::with_config(key_attr, RelationConfig::default(), fetch)
    }

    /// Create a new relation with explicit configuration
    pub fn with_config<F, Fut, R>(key_attr: impl Into<String>, config: RelationConfig, fetch: F) -> Self
    where
        F: Fn(&C, V::Key) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RelationResult<Option<R>>> + Send + 'static,
        R: Into<Arc<V>> + 'static,
    {
        let fetch: ItemFetcher<C, V> = Box::new(move |ctx: &C, key: V::Key| {
            fetch(ctx, key)
                .map(|outcome| outcome.map(|found| found.map(Into::into)))
                .boxed()
        });

        Self {
            key_attr: key_attr.into(),
            config,
            fetch,
            state: Mutex::new(SingleState {
                key: None,
                cell: ItemCell::new(),
            }),
        }
    }
}

impl<V: Record, C> SingleRelation<V, C> {
    /// Name of the key attribute this relation is stored under
    pub fn key_attr(&self) -> &str {
        &self.key_attr
    }

    pub fn config(&self) -> &RelationConfig {
        &self.config
    }

    /// Current key value, `None` while unset
    pub fn key(&self) -> Option<V::Key> {
        self.state.lock().key.clone()
    }

    /// Cached related record, if resolved
    pub fn item(&self) -> Option<Arc<V>> {
        self.state.lock().cell.item.clone()
    }

    /// Whether the related record is cached
    pub fn loaded(&self) -> bool {
        self.state.lock().cell.item.is_some()
    }

    /// Whether a fetch is currently in flight
    pub fn is_pending(&self) -> bool {
        self.state.lock().cell.flight.is_pending()
    }

    /// Return the cached record, start the fetch, or await the fetch in flight
    pub async fn get_item(&self, ctx: &C) -> RelationResult<Arc<V>> {
        let (key, joined) = {
            let state = self.state.lock();
            if let Some(item) = &state.cell.item {
                return Ok(Arc::clone(item));
            }
            let key = match &state.key {
                Some(key) => key.clone(),
                None => return Err(RelationError::key_not_set(&self.key_attr)),
            };

            (key, state.cell.flight.join().ok_or(state.cell.flight.epoch()))
        };

        let ticket = match joined {
            Ok(ticket) => ticket,
            Err(epoch) => {
                debug!(
                    relation = %self.key_attr,
                    key = ?key,
                    record_type = V::TYPE_NAME,
                    "fetching related record"
                );
                let fetch = (self.fetch)(ctx, key.clone());
                self.state.lock().cell.flight.start(epoch, fetch)
            }
        };

        let outcome = ticket.fetch.await;
        self.state
            .lock()
            .cell
            .settle(ticket.epoch, &self.key_attr, &key, outcome, &self.config)
    }

    /// Initialize the key value; fails if a key was already assigned
    pub fn init_key(&self, key: V::Key) -> RelationResult<()> {
        init_value(&mut self.state.lock().key, key, &self.key_attr)
    }

    /// Overwrite the key value, clearing the cached record if the key changed
    ///
    /// Use this when the relation is updated on an existing record.
    pub fn set_key(&self, key: V::Key) {
        let mut state = self.state.lock();
        if state.key.as_ref() == Some(&key) {
            return;
        }
        state.key = Some(key);
        state.cell.clear();
    }

    /// Cache a related record, validating that its key matches the current key
    pub fn init_item(&self, item: impl Into<Arc<V>>) -> RelationResult<()> {
        let item = item.into();
        let mut state = self.state.lock();
        init_value_or_same(&mut state.key, item.key(), &self.key_attr)?;
        state.cell.store(item);
        Ok(())
    }

    /// Cache a related record, overwriting the key value with its key
    pub fn set_item(&self, item: impl Into<Arc<V>>) {
        let item = item.into();
        let mut state = self.state.lock();
        state.key = Some(item.key());
        state.cell.store(item);
    }

    /// Drop the cached record and any fetch in flight; the key is kept
    pub fn clear_item(&self) {
        self.state.lock().cell.clear();
    }
}

impl<V: Record, C> fmt::Debug for SingleRelation<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SingleRelation")
            .field("key_attr", &self.key_attr)
            .field("record_type", &V::TYPE_NAME)
            .field("key", &state.key)
            .field("loaded", &state.cell.item.is_some())
            .finish()
    }
}
