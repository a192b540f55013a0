//! Paginated listing as a lazy stream
//!
//! Google list APIs return one page at a time plus a `nextPageToken`. The
//! stream built here fetches the next page only once the previous one has been
//! drained. It cannot be resumed after an error: the page token is dropped with
//! the stream, so callers build a fresh one to start over.

use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::future::Future;

/// One page of a list response
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Flatten a page-fetching function into a stream of items.
///
/// `fetch` receives `None` for the first page and the previous page's token
/// afterwards. An empty or missing token ends the stream.
pub fn paginate<'a, T, F, Fut>(fetch: F) -> BoxStream<'a, Result<T>>
where
    T: Send + 'a,
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T>>> + Send + 'a,
{
    stream::try_unfold((fetch, Cursor::Start), |(mut fetch, cursor)| async move {
        let token = match cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
            Cursor::Done => return Ok::<_, anyhow::Error>(None),
        };

        let page = fetch(token).await?;
        let next = match page.next_page_token.filter(|t| !t.is_empty()) {
            Some(token) => Cursor::Next(token),
            None => Cursor::Done,
        };

        let items = stream::iter(page.items.into_iter().map(Ok::<T, anyhow::Error>));
        Ok(Some((items, (fetch, next))))
    })
    .try_flatten()
    .boxed()
}
