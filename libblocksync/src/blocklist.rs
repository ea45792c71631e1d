//! The remote blocklist as an abstract capability.
//!
//! [`BlocklistApi`] is implemented over HTTP by
//! [`MastodonClient`](crate::MastodonClient) and in memory by
//! [`InMemoryBlocklist`](crate::memory::InMemoryBlocklist).

use crate::{
    error::SyncError,
    types::{BlockEntry, CreateOptions, DisposableDomain},
};
use async_trait::async_trait;
use futures::stream::{self, Stream, TryStreamExt};
use std::collections::HashSet;

/// Opaque position in the paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageCursor(pub String);

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub entries: Vec<BlockEntry>,
    pub next: Option<PageCursor>,
}

#[async_trait]
pub trait BlocklistApi: Send + Sync {
    /// Fetch one page. `None` starts from the beginning.
    async fn list_page(&self, cursor: Option<PageCursor>) -> Result<Page, SyncError>;

    /// Fails with [`SyncError::AlreadyExists`] when the domain is already blocked.
    async fn create(
        &self,
        domain: &DisposableDomain,
        options: &CreateOptions,
    ) -> Result<BlockEntry, SyncError>;

    /// Fails with [`SyncError::NotFound`] when the entry is already gone.
    async fn delete(&self, entry_id: &str) -> Result<(), SyncError>;
}

struct Walk {
    cursor: Option<PageCursor>,
    seen: HashSet<PageCursor>,
}

/// Every remote entry, following cursors page by page. Each call starts a
/// fresh walk from the first page. A cursor handed out twice ends the walk
/// with [`SyncError::Remote`].
pub fn list_blocked<A>(api: &A) -> impl Stream<Item = Result<BlockEntry, SyncError>> + Send + '_
where
    A: BlocklistApi + ?Sized,
{
    let start = Walk {
        cursor: None,
        seen: HashSet::new(),
    };
    stream::try_unfold(Some(start), move |state: Option<Walk>| async move {
        let Some(Walk { cursor, mut seen }) = state else {
            return Ok(None);
        };
        let page = api.list_page(cursor).await?;
        let next = match page.next {
            Some(next) if !seen.insert(next.clone()) => {
                return Err(SyncError::Remote(format!(
                    "pagination repeated cursor {:?}",
                    next.0
                )));
            }
            Some(next) => Some(Walk {
                cursor: Some(next),
                seen,
            }),
            None => None,
        };
        let entries = stream::iter(page.entries.into_iter().map(Ok::<_, SyncError>));
        Ok(Some((entries, next)))
    })
    .try_flatten()
}

/// Drains [`list_blocked`]. Planning needs the complete remote state.
pub async fn fetch_remote_state<A>(api: &A) -> Result<Vec<BlockEntry>, SyncError>
where
    A: BlocklistApi + ?Sized,
{
    list_blocked(api).try_collect().await
}
