use libblocksync::memory::{InMemoryBlocklist, InjectedFailure, StaticDomainSource};
use libblocksync::{
    plan, sync, ActionKind, DisposableDomain, DomainSet, ErrorKind, Operation, RetryConfig,
    SyncConfig, SyncError, SyncOptions, SyncSummary, Syncer,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn domain(s: &str) -> DisposableDomain {
    DisposableDomain::parse(s).unwrap()
}

fn syncer(
    source: &[&str],
    remote: &[&str],
    options: SyncOptions,
) -> Syncer<StaticDomainSource, InMemoryBlocklist> {
    let api = InMemoryBlocklist::with_page_size(2);
    api.seed(remote.iter().map(|d| domain(d)));
    Syncer::new(StaticDomainSource::from_lines(source.iter().copied()), api, options)
}

fn dry_run() -> SyncOptions {
    SyncOptions {
        dry_run: true,
        ..SyncOptions::default()
    }
}

fn with_removal() -> SyncOptions {
    SyncOptions {
        allow_removal: true,
        ..SyncOptions::default()
    }
}

// ── In-memory remote ────────────────────────────────────────────

#[tokio::test]
async fn second_run_has_nothing_to_add() {
    let syncer = syncer(&["spam.test", "evil.test", "junk.test"], &["evil.test"], SyncOptions::default());

    let first = syncer.run().await.unwrap();
    assert_eq!(first.added, 2);

    let second = syncer.run().await.unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.already_blocked, 3);
    assert!(second.actions.is_empty());
    assert_eq!(syncer.api().create_calls(), 2);
}

#[tokio::test]
async fn dry_run_never_mutates_but_reports_the_plan() {
    let syncer = syncer(
        &["spam.test", "evil.test", "keep.test"],
        &["keep.test", "stale.test"],
        SyncOptions {
            dry_run: true,
            allow_removal: true,
            ..SyncOptions::default()
        },
    );

    let summary = syncer.run().await.unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.added, 2);
    assert_eq!(summary.removed, 1);
    assert_eq!(syncer.api().mutating_calls(), 0);
    assert_eq!(syncer.api().domains(), [domain("keep.test"), domain("stale.test")]);
    assert!(summary
        .actions
        .iter()
        .all(|a| matches!(a.action, ActionKind::WouldAdd | ActionKind::WouldRemove)));
}

#[tokio::test]
async fn dry_run_summary_matches_real_run() {
    let source = ["a.test", "b.test", "c.test"];
    let remote = ["b.test"];

    let planned = syncer(&source, &remote, dry_run()).run().await.unwrap();
    let applied = syncer(&source, &remote, SyncOptions::default()).run().await.unwrap();
    assert_eq!(planned.added, applied.added);
    assert_eq!(planned.already_blocked, applied.already_blocked);
}

#[tokio::test]
async fn conflict_counts_as_already_blocked() {
    let syncer = syncer(&["spam.test", "evil.test"], &[], SyncOptions::default());
    let source: DomainSet = [domain("spam.test"), domain("evil.test")].into_iter().collect();
    let plan = plan(&source, &[], false);

    // evil.test gets blocked between listing and applying
    syncer.api().seed([domain("evil.test")]);

    let mut summary = SyncSummary::default();
    syncer.apply(&plan, &mut summary).await.unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.already_blocked, 1);
    assert!(summary.errors.is_empty());
    let evil = summary.actions.iter().find(|a| a.domain == domain("evil.test")).unwrap();
    assert_eq!(evil.action, ActionKind::AlreadyBlocked);
}

#[tokio::test]
async fn three_pages_are_drained_before_planning() {
    let remote = ["a.test", "b.test", "c.test", "d.test", "e.test"];
    let syncer = syncer(&remote, &remote, SyncOptions::default());

    let summary = syncer.run().await.unwrap();
    assert_eq!(syncer.api().list_calls(), 3);
    assert_eq!(summary.remote_entries, 5);
    assert_eq!(summary.added, 0);
    assert_eq!(syncer.api().create_calls(), 0);
}

#[tokio::test]
async fn malformed_source_line_is_skipped_and_counted() {
    let syncer = syncer(&["spam.test", "not a domain"], &[], SyncOptions::default());

    let summary = syncer.run().await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.added, 1);
    assert_eq!(syncer.api().domains(), [domain("spam.test")]);
}

#[tokio::test]
async fn one_failing_domain_does_not_stop_the_run() {
    let syncer = syncer(&["a.test", "b.test", "c.test", "d.test"], &[], SyncOptions::default());
    syncer.api().fail_on("b.test", InjectedFailure::Remote);
    syncer.api().fail_on("d.test", InjectedFailure::Remote);

    let summary = syncer.run().await.unwrap();
    assert_eq!(summary.added, 2);
    assert!(!summary.is_success());
    let failed: Vec<_> = summary.errors.iter().map(|f| (f.domain.as_str(), f.kind)).collect();
    assert_eq!(failed, [("b.test", ErrorKind::Remote), ("d.test", ErrorKind::Remote)]);
    assert_eq!(summary.failed(Operation::Add), 2);
    assert_eq!(summary.failed(Operation::Remove), 0);
    assert_eq!(syncer.api().domains(), [domain("a.test"), domain("c.test")]);
}

#[tokio::test]
async fn stale_blocks_are_kept_by_default() {
    let syncer = syncer(&["keep.test"], &["keep.test", "stale.test"], SyncOptions::default());

    let summary = syncer.run().await.unwrap();
    assert_eq!(summary.removed, 0);
    assert_eq!(syncer.api().delete_calls(), 0);
    assert_eq!(syncer.api().domains().len(), 2);
}

#[tokio::test]
async fn stale_blocks_are_removed_when_allowed() {
    let syncer = syncer(&["keep.test", "new.test"], &["keep.test", "stale.test", "old.test"], with_removal());
    syncer.api().fail_on("old.test", InjectedFailure::Remote);

    let summary = syncer.run().await.unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].domain, domain("old.test"));
    assert_eq!(summary.errors[0].operation, Operation::Remove);
    assert_eq!(summary.failed(Operation::Add), 0);
    assert_eq!(
        syncer.api().domains(),
        [domain("keep.test"), domain("new.test"), domain("old.test")]
    );
}

#[tokio::test]
async fn auth_failure_mid_run_is_fatal() {
    let syncer = syncer(&["a.test", "b.test", "c.test"], &[], SyncOptions::default());
    syncer.api().fail_on("b.test", InjectedFailure::Auth);

    let err = syncer.run().await.unwrap_err();
    assert!(matches!(err, SyncError::Auth { .. }));
    assert_eq!(syncer.api().domains(), [domain("a.test")]);
}

// ── Over HTTP ───────────────────────────────────────────────────

const BLOCKS: &str = "/api/v1/admin/email_domain_blocks";

async fn mastodon_with_source(source: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list.conf"))
        .respond_with(ResponseTemplate::new(200).set_body_string(source))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(BLOCKS))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "id": "1", "domain": "evil.test", "created_at": null }])),
        )
        .mount(&server)
        .await;
    server
}

fn http_config(server: &MockServer, options: SyncOptions) -> SyncConfig {
    let mut config = SyncConfig::new(server.uri(), "token");
    config.source_url = format!("{}/list.conf", server.uri());
    config.options = options;
    config.retry = RetryConfig {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(10),
    };
    config
}

#[tokio::test]
async fn sync_over_http_creates_missing_blocks() {
    let server = mastodon_with_source("spam.test\nevil.test\n").await;
    Mock::given(method("POST"))
        .and(path(BLOCKS))
        .and(body_json(json!({ "domain": "spam.test" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "2", "domain": "spam.test", "created_at": null })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let summary = sync(&http_config(&server, SyncOptions::default())).await.unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.already_blocked, 1);
    assert!(summary.is_success());
}

#[tokio::test]
async fn sync_over_http_dry_run_posts_nothing() {
    let server = mastodon_with_source("spam.test\nevil.test\nfresh.test\n").await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let summary = sync(&http_config(&server, dry_run())).await.unwrap();
    assert_eq!(summary.added, 2);
}

#[tokio::test]
async fn sync_over_http_records_persistent_failures() {
    let server = mastodon_with_source("spam.test\n").await;
    Mock::given(method("POST"))
        .and(path(BLOCKS))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let summary = sync(&http_config(&server, SyncOptions::default())).await.unwrap();
    assert_eq!(summary.added, 0);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].kind, ErrorKind::Remote);
}

#[tokio::test]
async fn sync_over_http_aborts_when_source_is_down() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list.conf"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(BLOCKS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let err = sync(&http_config(&server, SyncOptions::default())).await.unwrap_err();
    assert!(matches!(err, SyncError::SourceUnavailable { .. }));
}
