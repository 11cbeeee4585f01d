//! Relations - lazy-loaded, single-flight caches for related records
//!
//! A record holds one relation per foreign-key field:
//! - [`SingleRelation`] for a required reference to one record
//! - [`NullableSingleRelation`] for an optional reference, where a null key is a resolved state
//! - [`CollectionRelation`] for the records that point back at a parent
//!
//! Reading cached state never suspends. The async getters either return the
//! cached value, start the single fetch, or await the fetch already in flight.

mod flight;

pub mod collection;
pub mod nullable;
pub mod single;

pub use collection::{CollectionFetcher, CollectionRelation, Items};
pub use nullable::{KeyState, NullableSingleRelation};
pub use single::{ItemFetcher, SingleRelation};
