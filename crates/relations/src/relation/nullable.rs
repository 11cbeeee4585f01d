//! NullableSingleRelation - lazy-loaded reference to zero or one related record
//!
//! Unlike [`SingleRelation`](super::SingleRelation), an explicit null key is
//! a valid, resolved state: the relation is intentionally absent.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::RelationConfig;
use crate::error::{RelationError, RelationResult};
use crate::record::Record;

use super::flight::ItemCell;
use super::single::ItemFetcher;

/// Key of a nullable relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyState<K> {
    /// Not known yet; the relation cannot be resolved
    Unset,
    /// Explicitly null; the relation resolves to no record
    Null,
    /// Points at a related record
    Set(K),
}

impl<K> KeyState<K> {
    fn from_option(key: Option<K>) -> Self {
        match key {
            Some(key) => KeyState::Set(key),
            None => KeyState::Null,
        }
    }

    /// The key value, treating both unset and null as `None`
    pub fn value(&self) -> Option<&K> {
        match self {
            KeyState::Set(key) => Some(key),
            KeyState::Unset | KeyState::Null => None,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, KeyState::Unset)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, KeyState::Null)
    }
}

struct NullableState<V: Record> {
    key: KeyState<V::Key>,
    cell: ItemCell<V>,
}

/// Lazy-loaded, single-flight cache for an optional related record
pub struct NullableSingleRelation<V: Record, C> {
    key_attr: String,
    config: RelationConfig,
    fetch: ItemFetcher<C, V>,
    state: Mutex<NullableState<V>>,
}

impl<V: Record, C: 'static> NullableSingleRelation<V, C> {
    /// Create a new relation; `key_attr` is only used in error messages
    pub fn new<F, Fut, R>(key_attr: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(&C, V::Key) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RelationResult<Option<R>>> + Send + 'static,
        R: Into<Arc<V>> + 'static,
    {
        Self::with_config(key_attr, RelationConfig::default(), fetch)
    }

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
            state: Mutex::new(NullableState {
                key: KeyState::Unset,
                cell: ItemCell::new(),
            }),
        }
    }
}

impl<V: Record, C> NullableSingleRelation<V, C> {
    pub fn key_attr(&self) -> &str {
        &self.key_attr
    }

    pub fn config(&self) -> &RelationConfig {
        &self.config
    }

    /// Current key value; `None` when unset or explicitly null
    pub fn key(&self) -> Option<V::Key> {
        self.state.lock().key.value().cloned()
    }

    /// Current key, distinguishing unset from explicitly null
    pub fn key_state(&self) -> KeyState<V::Key> {
        self.state.lock().key.clone()
    }

    pub fn item(&self) -> Option<Arc<V>> {
        self.state.lock().cell.item.clone()
    }

    /// Whether the relation is resolved: the key is null or the record is cached
    pub fn loaded(&self) -> bool {
        let state = self.state.lock();
        state.key.is_null() || state.cell.item.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().cell.flight.is_pending()
    }

    /// Return the cached record, start the fetch, or await the fetch in flight
    ///
    /// Resolves to `None` without fetching when the key is explicitly null.
    pub async fn get_item(&self, ctx: &C) -> RelationResult<Option<Arc<V>>> {
        let (key, joined) = {
            let state = self.state.lock();
            if let Some(item) = &state.cell.item {
                return Ok(Some(Arc::clone(item)));
            }
            let key = match &state.key {
                KeyState::Set(key) => key.clone(),
                KeyState::Null => return Ok(None),
                KeyState::Unset => return Err(RelationError::key_not_set(&self.key_attr)),
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
            .map(Some)
    }

    /// Initialize the key value; `None` initializes the relation as explicitly null
    ///
    /// A null key counts as initialized: a later `init_key` or
    /// [`init_item`](Self::init_item) fails with `AlreadyInitialized`. This is
    /// stricter than treating null as "not yet assigned"; use
    /// [`set_key`](Self::set_key) to replace a null key.
    pub fn init_key(&self, key: Option<V::Key>) -> RelationResult<()> {
        let mut state = self.state.lock();
        if !state.key.is_unset() {
            return Err(RelationError::already_initialized(&self.key_attr));
        }
        state.key = KeyState::from_option(key);
        Ok(())
    }

    /// Overwrite the key value, clearing the cached record if the key changed
    pub fn set_key(&self, key: Option<V::Key>) {
        let key = KeyState::from_option(key);
        let mut state = self.state.lock();
        if state.key == key {
            return;
        }
        state.key = key;
        state.cell.clear();
    }

    /// Cache a related record, validating that its key matches the current key
    pub fn init_item(&self, item: impl Into<Arc<V>>) -> RelationResult<()> {
        let item = item.into();
        let key = item.key();
        let mut state = self.state.lock();
        match &state.key {
            KeyState::Unset => {}
            KeyState::Set(current) if *current == key => {}
            _ => return Err(RelationError::already_initialized(&self.key_attr)),
        }
        state.key = KeyState::Set(key);
        state.cell.store(item);
        Ok(())
    }

    /// Cache a related record, overwriting the key value
    ///
    /// `None` sets the key to null: the relation is explicitly cleared, which
    /// is different from [`clear_item`](Self::clear_item).
    pub fn set_item(&self, item: Option<Arc<V>>) {
        let mut state = self.state.lock();
        match item {
            Some(item) => {
                state.key = KeyState::Set(item.key());
                state.cell.store(item);
            }
            None => {
                state.key = KeyState::Null;
                state.cell.clear();
            }
        }
    }

    /// Drop the cached record and any fetch in flight; the key is kept
    pub fn clear_item(&self) {
        self.state.lock().cell.clear();
    }
}

impl<V: Record, C> fmt::Debug for NullableSingleRelation<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NullableSingleRelation")
            .field("key_attr", &self.key_attr)
            .field("record_type", &V::TYPE_NAME)
            .field("key", &state.key)
            .field("loaded", &(state.key.is_null() || state.cell.item.is_some()))
            .finish()
    }
}
