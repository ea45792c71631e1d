use crate::{
    blocklist::{fetch_remote_state, BlocklistApi},
    error::SyncError,
    planner::plan,
    source::DomainSource,
    types::{
        ActionKind, BlockEntry, DisposableDomain, Operation, SyncOptions, SyncPlan, SyncSummary,
    },
};
use tracing::{debug, info, warn};

/// Drives one sync: fetch the source, drain the remote, plan, apply.
pub struct Syncer<S, A> {
    source: S,
    api: A,
    options: SyncOptions,
}

impl<S, A> Syncer<S, A>
where
    S: DomainSource,
    A: BlocklistApi,
{
    pub fn new(source: S, api: A, options: SyncOptions) -> Self {
        Self {
            source,
            api,
            options,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Runs to completion. Per-domain failures end up in
    /// [`SyncSummary::errors`]; only fatal errors are returned as `Err`.
    pub async fn run(&self) -> Result<SyncSummary, SyncError> {
        let source = self.source.fetch().await?;

        info!("Fetching existing email domain blocks");
        let remote = fetch_remote_state(&self.api).await?;
        info!(existing = remote.len(), "Fetched existing email domain blocks");

        let plan = plan(&source.domains, &remote, self.options.allow_removal);
        info!(
            to_add = plan.to_add.len(),
            to_remove = plan.to_remove.len(),
            dry_run = self.options.dry_run,
            "Planned sync"
        );

        let mut summary = SyncSummary {
            dry_run: self.options.dry_run,
            source_domains: source.domains.len(),
            remote_entries: remote.len(),
            skipped: source.skipped,
            already_blocked: source.domains.len() - plan.to_add.len(),
            ..SyncSummary::default()
        };

        self.apply(&plan, &mut summary).await?;

        info!(
            added = summary.added,
            removed = summary.removed,
            already_blocked = summary.already_blocked,
            failed_to_add = summary.failed(Operation::Add),
            failed_to_remove = summary.failed(Operation::Remove),
            "Sync complete"
        );
        Ok(summary)
    }

    /// Applies a plan. Stops early only on a fatal error.
    pub async fn apply(&self, plan: &SyncPlan, summary: &mut SyncSummary) -> Result<(), SyncError> {
        for domain in &plan.to_add {
            self.add_one(domain, summary).await?;
        }
        for entry in &plan.to_remove {
            self.remove_one(entry, summary).await?;
        }
        Ok(())
    }

    async fn add_one(&self, domain: &DisposableDomain, summary: &mut SyncSummary) -> Result<(), SyncError> {
        if self.options.dry_run {
            debug!(%domain, "Would block domain");
            summary.added += 1;
            summary.record(domain, ActionKind::WouldAdd);
            return Ok(());
        }

        match self.api.create(domain, &self.options.create).await {
            Ok(_) => {
                debug!(%domain, "Blocked domain");
                summary.added += 1;
                summary.record(domain, ActionKind::Added);
            }
            Err(SyncError::AlreadyExists(_)) => {
                debug!(%domain, "Already blocked");
                summary.already_blocked += 1;
                summary.record(domain, ActionKind::AlreadyBlocked);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(%domain, "Failed to block domain: {}", e);
                summary.record_failure(domain, Operation::Add, &e);
            }
        }
        Ok(())
    }

    async fn remove_one(&self, entry: &BlockEntry, summary: &mut SyncSummary) -> Result<(), SyncError> {
        let domain = &entry.domain;
        if self.options.dry_run {
            debug!(%domain, id = %entry.id, "Would remove domain");
            summary.removed += 1;
            summary.record(domain, ActionKind::WouldRemove);
            return Ok(());
        }

        match self.api.delete(&entry.id).await {
            Ok(()) => {
                debug!(%domain, id = %entry.id, "Removed domain");
                summary.removed += 1;
                summary.record(domain, ActionKind::Removed);
            }
            Err(SyncError::NotFound(_)) => {
                debug!(%domain, id = %entry.id, "Already removed");
                summary.record(domain, ActionKind::AlreadyRemoved);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(%domain, "Failed to remove domain: {}", e);
                summary.record_failure(domain, Operation::Remove, &e);
            }
        }
        Ok(())
    }
}
