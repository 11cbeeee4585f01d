//! # elif-relations: Relation caches for elif.rs records
//!
//! Lazy-loaded, single-flight caching primitives for "related record"
//! lookups. A record keeps one relation per foreign-key field; the relation
//! holds the key, fetches the related record (or collection) at most once no
//! matter how many callers ask concurrently, caches it, and stays coherent
//! when the key or the collection is mutated locally.
//!
//! ```rust
//! use std::sync::Arc;
//! use elif_relations::{Record, RelationResult, SingleRelation};
//!
//! #[derive(Debug)]
//! struct Invoice { id: i64 }
//!
//! impl Record for Invoice {
//!     type Key = i64;
//!     const TYPE_NAME: &'static str = "example:invoice";
//!     fn key(&self) -> i64 { self.id }
//! }
//!
//! # futures::executor::block_on(async {
//! let invoice = SingleRelation::<Invoice, ()>::new("invoiceId", |_: &(), id: i64| async move {
//!     RelationResult::Ok(Some(Invoice { id }))
//! });
//! invoice.init_key(11).unwrap();
//!
//! let first = invoice.get_item(&()).await.unwrap();
//! let second = invoice.get_item(&()).await.unwrap();
//! assert!(Arc::ptr_eq(&first, &second));
//! # });
//! ```

pub mod config;
pub mod error;
pub mod init;
pub mod record;
pub mod relation;
pub mod stream;

// Re-export main types
pub use config::*;
pub use error::*;
pub use init::*;
pub use record::*;
pub use relation::*;
pub use stream::{collect, stream_of};
