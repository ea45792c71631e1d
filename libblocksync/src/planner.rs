use crate::types::{BlockEntry, DomainSet, SyncPlan};

/// Computes what has to change remotely for it to match `source`.
///
/// Domains are compared exactly after normalization; `sub.evil.test` and
/// `evil.test` are unrelated. Removals are only planned when `allow_removal`
/// is set, otherwise blocks that fell out of the source list are left alone.
pub fn plan(source: &DomainSet, remote: &[BlockEntry], allow_removal: bool) -> SyncPlan {
    let remote_domains: DomainSet = remote.iter().map(|e| e.domain.clone()).collect();

    let to_add = source.difference(&remote_domains).cloned().collect();

    let mut to_remove: Vec<BlockEntry> = if allow_removal {
        remote
            .iter()
            .filter(|e| !source.contains(&e.domain))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };
    to_remove.sort_by(|a, b| a.domain.cmp(&b.domain).then_with(|| a.id.cmp(&b.id)));

    SyncPlan { to_add, to_remove }
}
