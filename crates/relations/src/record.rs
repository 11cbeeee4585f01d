//! Record identity - the keyed record capability consumed by relations

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{RelationError, RelationResult};

/// A record with a stable key and a type tag
///
/// Relations only ever look at a record through this trait: the key is used
/// for key-equality comparisons and the type tag for error messages.
pub trait Record: Send + Sync + 'static {
    /// The key value or tuple identifying the record
    type Key: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// The type name of the record, e.g. `example:invoice`
    const TYPE_NAME: &'static str;

    /// Get the key of this record
    fn key(&self) -> Self::Key;

    /// Get the type name of this record
    fn record_type(&self) -> &'static str {
        Self::TYPE_NAME
    }
}

/// Either a bare key or a full record instance
///
/// Operations that accept "an id or the record itself" take this instead of
/// being overloaded.
#[derive(Debug)]
pub enum KeyOrRecord<V: Record> {
    Key(V::Key),
    Record(Arc<V>),
}

impl<V: Record> KeyOrRecord<V> {
    /// Resolve the key regardless of which variant is held
    pub fn key(&self) -> V::Key {
        match self {
            KeyOrRecord::Key(key) => key.clone(),
            KeyOrRecord::Record(record) => record.key(),
        }
    }

    /// Get the record instance if one is held
    pub fn record(&self) -> Option<&Arc<V>> {
        match self {
            KeyOrRecord::Key(_) => None,
            KeyOrRecord::Record(record) => Some(record),
        }
    }
}

impl<V: Record> Clone for KeyOrRecord<V> {
    fn clone(&self) -> Self {
        match self {
            KeyOrRecord::Key(key) => KeyOrRecord::Key(key.clone()),
            KeyOrRecord::Record(record) => KeyOrRecord::Record(Arc::clone(record)),
        }
    }
}

impl<V: Record> From<Arc<V>> for KeyOrRecord<V> {
    fn from(record: Arc<V>) -> Self {
        KeyOrRecord::Record(record)
    }
}

impl<V: Record> From<V> for KeyOrRecord<V> {
    fn from(record: V) -> Self {
        KeyOrRecord::Record(Arc::new(record))
    }
}

/// Check that refreshed data belongs to the record being refreshed
pub fn ensure_same_record<K>(record_type: &str, expected: &K, actual: &K) -> RelationResult<()>
where
    K: PartialEq + Debug,
{
    if expected == actual {
        Ok(())
    } else {
        Err(RelationError::key_mismatch(record_type, expected, actual))
    }
}
