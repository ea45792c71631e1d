//! In-memory stand-ins for the remote blocklist and the domain source.
//!
//! Useful for tests and for rehearsing a sync without a server.

use crate::{
    blocklist::{BlocklistApi, Page, PageCursor},
    error::SyncError,
    source::DomainSource,
    types::{BlockEntry, CreateOptions, DisposableDomain, SourceList},
};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

/// Kinds of failure that can be scripted per domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Remote,
    Auth,
}

impl InjectedFailure {
    fn to_error(self, domain: &str) -> SyncError {
        match self {
            InjectedFailure::Remote => SyncError::Remote(format!("injected failure for {}", domain)),
            InjectedFailure::Auth => SyncError::Auth { status: 401 },
        }
    }
}

#[derive(Default)]
struct State {
    // keyed by numeric id so listing order matches creation order
    entries: BTreeMap<u64, BlockEntry>,
    next_id: u64,
    failures: HashMap<String, InjectedFailure>,
}

/// A [`BlocklistApi`] backed by a map, with the server's conflict and
/// not-found semantics.
pub struct InMemoryBlocklist {
    state: Mutex<State>,
    page_size: usize,
    list_calls: AtomicUsize,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl InMemoryBlocklist {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            page_size: page_size.max(1),
            list_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    /// Insert entries directly, bypassing call counters and failures.
    pub fn seed<I>(&self, domains: I)
    where
        I: IntoIterator<Item = DisposableDomain>,
    {
        let mut state = self.lock();
        for domain in domains {
            insert(&mut state, domain);
        }
    }

    /// Make every create/delete touching `domain` fail.
    pub fn fail_on(&self, domain: &str, failure: InjectedFailure) {
        self.lock().failures.insert(domain.to_string(), failure);
    }

    pub fn domains(&self) -> Vec<DisposableDomain> {
        let mut domains: Vec<_> = self.lock().entries.values().map(|e| e.domain.clone()).collect();
        domains.sort();
        domains
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::Relaxed)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::Relaxed)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::Relaxed)
    }

    pub fn mutating_calls(&self) -> usize {
        self.create_calls() + self.delete_calls()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryBlocklist {
    fn default() -> Self {
        Self::new()
    }
}

fn insert(state: &mut State, domain: DisposableDomain) -> BlockEntry {
    let id = state.next_id;
    state.next_id += 1;
    let entry = BlockEntry {
        id: id.to_string(),
        domain,
        created_at: Some(Utc::now()),
    };
    state.entries.insert(id, entry.clone());
    entry
}

#[async_trait]
impl BlocklistApi for InMemoryBlocklist {
    async fn list_page(&self, cursor: Option<PageCursor>) -> Result<Page, SyncError> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);

        let offset = match cursor {
            Some(PageCursor(raw)) => raw
                .parse::<usize>()
                .map_err(|_| SyncError::Remote(format!("bad cursor {:?}", raw)))?,
            None => 0,
        };

        let state = self.lock();
        let entries: Vec<_> = state
            .entries
            .values()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();
        let consumed = offset + entries.len();
        let next = (consumed < state.entries.len()).then(|| PageCursor(consumed.to_string()));

        Ok(Page { entries, next })
    }

    async fn create(
        &self,
        domain: &DisposableDomain,
        _options: &CreateOptions,
    ) -> Result<BlockEntry, SyncError> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        if let Some(failure) = state.failures.get(domain.as_str()) {
            return Err(failure.to_error(domain.as_str()));
        }
        if state.entries.values().any(|e| &e.domain == domain) {
            return Err(SyncError::AlreadyExists(domain.to_string()));
        }
        Ok(insert(&mut state, domain.clone()))
    }

    async fn delete(&self, entry_id: &str) -> Result<(), SyncError> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        let key = entry_id
            .parse::<u64>()
            .map_err(|_| SyncError::NotFound(entry_id.to_string()))?;
        let Some(entry) = state.entries.get(&key) else {
            return Err(SyncError::NotFound(entry_id.to_string()));
        };
        if let Some(failure) = state.failures.get(entry.domain.as_str()) {
            return Err(failure.to_error(entry.domain.as_str()));
        }
        state.entries.remove(&key);
        Ok(())
    }
}

/// A fixed [`DomainSource`].
pub struct StaticDomainSource {
    list: SourceList,
}

impl StaticDomainSource {
    pub fn new(list: SourceList) -> Self {
        Self { list }
    }

    /// Builds the list from raw lines, counting the ones that do not parse.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = SourceList::default();
        for line in lines {
            match DisposableDomain::parse(line.as_ref()) {
                Ok(domain) => {
                    list.domains.insert(domain);
                }
                Err(_) => list.skipped += 1,
            }
        }
        Self { list }
    }
}

#[async_trait]
impl DomainSource for StaticDomainSource {
    async fn fetch(&self) -> Result<SourceList, SyncError> {
        Ok(self.list.clone())
    }
}
