//! Stream helpers for collection fetch functions backed by streaming repositories

use futures::stream::{self, Stream, TryStreamExt};

use crate::error::RelationResult;

/// Stream owned items, e.g. from an in-memory repository
pub fn stream_of<T, I>(items: I) -> impl Stream<Item = RelationResult<T>>
where
    I: IntoIterator<Item = T>,
{
    stream::iter(items.into_iter().map(Ok))
}

/// Collect a fallible stream into a vector, stopping at the first error
pub async fn collect<T, S>(stream: S) -> RelationResult<Vec<T>>
where
    S: Stream<Item = RelationResult<T>>,
{
    stream.try_collect().await
}
