//! Single-flight fetch slot shared by all relation kinds
//!
//! A relation holds at most one in-flight fetch. Every caller that arrives
//! while it is pending clones the same [`Shared`] future and therefore sees
//! the same outcome. The slot carries an epoch that is bumped whenever the
//! slot is cleared or replaced, so an outcome that settles after the relation
//! was mutated can be recognized as stale and kept out of the cache.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::trace;

use crate::config::RelationConfig;
use crate::error::{RelationError, RelationResult};
use crate::record::Record;

/// Outcome of fetching a single related record
pub type ItemOutcome<V> = RelationResult<Option<Arc<V>>>;

/// Outcome of fetching a related collection, already materialized
pub type CollectionOutcome<V> = RelationResult<Arc<Vec<Arc<V>>>>;

pub(crate) type SharedFetch<T> = Shared<BoxFuture<'static, T>>;

/// Handle to the in-flight fetch a caller should await
pub(crate) struct Ticket<T: Clone> {
    pub fetch: SharedFetch<T>,
    pub epoch: u64,
}

pub(crate) struct Flight<T: Clone> {
    pending: Option<SharedFetch<T>>,
    epoch: u64,
}

impl<T: Clone> Flight<T> {
    pub fn new() -> Self {
        Self {
            pending: None,
            epoch: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Ticket for the fetch in flight, if there is one
    pub fn join(&self) -> Option<Ticket<T>> {
        self.pending.as_ref().map(|fetch| {
            trace!(epoch = self.epoch, "joining in-flight fetch");
            Ticket {
                fetch: fetch.clone(),
                epoch: self.epoch,
            }
        })
    }

    /// Install `fetch`, built by a caller that saw the slot empty at `epoch`
    ///
    /// The fetch must be built without holding the relation lock, so another
    /// caller may have installed one in the meantime; that one is joined and
    /// `fetch` is dropped unpolled. If the slot was reset since `epoch`, the
    /// fetch still answers its caller but is not installed, and its outcome
    /// is stale.
    pub fn start(&mut self, epoch: u64, fetch: BoxFuture<'static, T>) -> Ticket<T> {
        if !self.is_current(epoch) {
            trace!(epoch, current = self.epoch, "relation changed while building fetch");
            return Ticket {
                fetch: fetch.shared(),
                epoch,
            };
        }
        if let Some(ticket) = self.join() {
            return ticket;
        }

        let fetch = fetch.shared();
        self.pending = Some(fetch.clone());
        Ticket {
            fetch,
            epoch: self.epoch,
        }
    }

    /// Drop the in-flight fetch; outcomes of earlier tickets become stale
    pub fn reset(&mut self) {
        self.pending = None;
        self.epoch = self.epoch.wrapping_add(1);
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    /// Whether a fetch has been started and has not settled yet
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .map_or(false, |fetch| fetch.peek().is_none())
    }
}

/// Cached item plus the fetch that resolves it
pub(crate) struct ItemCell<V: Record> {
    pub item: Option<Arc<V>>,
    pub flight: Flight<ItemOutcome<V>>,
}

impl<V: Record> ItemCell<V> {
    pub fn new() -> Self {
        Self {
            item: None,
            flight: Flight::new(),
        }
    }

    pub fn store(&mut self, item: Arc<V>) {
        self.item = Some(item);
        self.flight.reset();
    }

    pub fn clear(&mut self) {
        self.item = None;
        self.flight.reset();
    }

    /// Turn a settled fetch into the caller's result, caching it when still current
    pub fn settle(
        &mut self,
        epoch: u64,
        key_attr: &str,
        requested: &V::Key,
        outcome: ItemOutcome<V>,
        config: &RelationConfig,
    ) -> RelationResult<Arc<V>> {
        let current = self.flight.is_current(epoch);
        if !current {
            trace!(relation = key_attr, key = ?requested, "fetch settled after relation changed");
        }

        let result = match outcome {
            Ok(Some(item)) => {
                let fetched = item.key();
                if *config.get_verify_fetched_keys() && fetched != *requested {
                    Err(RelationError::key_mismatch(V::TYPE_NAME, requested, &fetched))
                } else {
                    Ok(item)
                }
            }
            Ok(None) => Err(RelationError::not_found(key_attr, requested)),
            Err(err) => Err(err),
        };

        if current {
            match &result {
                Ok(item) => self.item = Some(Arc::clone(item)),
                Err(_) if config.resets_failures() => self.flight.reset(),
                Err(_) => {}
            }
        }

        result
    }
}
