//! End-to-end comparison scenarios over the plain-text page source.

use std::sync::Arc;
use std::time::Duration;

use clausediff::{
    CompareOptions, EmbedderChoice, HashedEmbedder, JobStatus, JobStore, MatchStatus, Orchestrator,
    OrchestratorConfig, Pipeline, PlainTextSource, ProgressBus, SegmentStore,
};

fn pipeline() -> Pipeline {
    Pipeline::new(
        CompareOptions::default(),
        Arc::new(HashedEmbedder::default()),
        Arc::new(PlainTextSource),
    )
}

fn compare(a: &str, b: &str) -> clausediff::ComparisonResult {
    pipeline().compare(a.as_bytes(), b.as_bytes()).unwrap()
}

#[test]
fn identical_documents_are_fully_unchanged() {
    let text = "1. COVERAGE\n\nWe will pay for theft of contents.\n\n2. EXCLUSIONS\n\nWe will not pay for loss caused by flood.\n\nAn excess of $500 applies to each claim.";
    let result = compare(text, text);

    assert!(result.matches.len() >= 3);
    assert!(result
        .matches
        .iter()
        .all(|m| m.status == MatchStatus::Unchanged));
    assert!(result
        .matches
        .iter()
        .all(|m| m.similarity.unwrap() > 0.999 && m.materiality_score == 0.0));
    assert!(result.summary.bullets.is_empty());
    assert_eq!(result.summary.counts.modified, 0);
    assert_eq!(result.summary.counts.added, 0);
    assert_eq!(result.summary.counts.removed, 0);
}

#[test]
fn pure_addition_yields_one_added_one_unchanged() {
    let a = "We will pay for theft of contents.";
    let b = "We will pay for theft of contents.\n\nWe will not pay for loss caused by flood.";
    let result = compare(a, b);

    assert_eq!(result.summary.counts.added, 1);
    assert_eq!(result.summary.counts.removed, 0);
    assert_eq!(result.summary.counts.modified, 0);
    assert_eq!(result.summary.counts.unchanged, 1);

    let added = result
        .matches
        .iter()
        .find(|m| m.status == MatchStatus::Added)
        .unwrap();
    assert!(added.a_id.is_none());
    assert!(added.similarity.is_none());
    assert!(result.summary.bullets[0].starts_with("Added Exclusion"));
}

#[test]
fn strictness_tightening_is_a_reviewed_modification() {
    let a = "We will pay for theft.";
    let b = "We will pay for theft, provided a police report is filed within 48 hours.";
    let result = compare(a, b);

    let modified: Vec<_> = result
        .matches
        .iter()
        .filter(|m| m.status == MatchStatus::Modified)
        .collect();
    assert_eq!(modified.len(), 1);
    assert_eq!(modified[0].strictness_delta, -1);
    assert!(modified[0].materiality_score > 0.1);
    assert!(modified[0].review_required);
}

#[test]
fn polarity_flip_across_types_surfaces_for_review() {
    // The clause-type gate keeps coverage and exclusion clauses from
    // pairing, so a grant that becomes an exclusion shows up as a
    // removed/added couple, each fully material.
    let a = "Flood damage is covered.";
    let b = "Flood damage is excluded.";
    let result = compare(a, b);

    assert_eq!(result.summary.counts.removed, 1);
    assert_eq!(result.summary.counts.added, 1);
    for m in &result.matches {
        assert!(m.materiality_score >= 0.35);
        assert!(m.review_required);
    }
}

#[test]
fn numeric_halving_is_flagged() {
    let a = "Limit of liability: $10,000,000 for any one occurrence.";
    let b = "Limit of liability: $5,000,000 for any one occurrence.";
    let result = compare(a, b);

    let modified = result
        .matches
        .iter()
        .find(|m| m.status == MatchStatus::Modified)
        .expect("limit clauses should pair");
    let delta = modified
        .numeric_delta
        .as_ref()
        .unwrap()
        .get("limit")
        .unwrap();
    assert_eq!(delta.a_value, Some(10_000_000.0));
    assert_eq!(delta.b_value, Some(5_000_000.0));
    assert!((delta.delta_pct.unwrap() + 50.0).abs() < 1e-9);
    assert!(modified.review_required);
    assert!(result
        .summary
        .bullets
        .iter()
        .any(|b| b.contains("limit changed from 10000000 to 5000000")));
}

#[test]
fn empty_document_comparison_succeeds_with_warning() {
    let empty = "POLICY SCHEDULE\n\nInsured Example Pty Ltd\nPolicy Number ABC-123";
    let b = "We will pay for theft of contents.\n\nWe will not pay for flood damage.";
    let result = compare(empty, b);

    assert!(result
        .warnings
        .iter()
        .any(|w| w == "empty document"));
    assert_eq!(result.summary.counts.added, 2);
    assert_eq!(result.summary.counts.removed, 0);
    // The admin furniture is excluded, not matched.
    assert!(!result.unmapped_a.is_empty());
}

#[test]
fn admin_blocks_never_appear_in_matches() {
    let a = "POLICY SCHEDULE\n\nPolicy Number ABC-123\n\n1. COVERAGE\n\nWe will pay for theft.";
    let b = "1. COVERAGE\n\nWe will pay for theft.";
    let result = compare(a, b);

    for admin_id in &result.unmapped_a {
        assert!(result
            .matches
            .iter()
            .all(|m| m.a_id.as_deref() != Some(admin_id.as_str())));
    }
    assert!(!result.unmapped_a.is_empty());
}

#[test]
fn matches_are_ordered_by_status_rank() {
    let a = "We will pay for theft of contents.\n\nWe will pay for accidental glass breakage.\n\nWe will not pay for wear and tear.";
    let b = "We will pay for theft of contents or stock.\n\nWe will not pay for wear and tear.\n\nTerrorism is excluded.";
    let result = compare(a, b);

    let ranks: Vec<u8> = result.matches.iter().map(|m| m.status.rank()).collect();
    let mut sorted = ranks.clone();
    sorted.sort();
    assert_eq!(ranks, sorted, "matches must be grouped by status rank");
}

#[test]
fn similarity_is_null_exactly_for_one_sided_matches() {
    let a = "We will pay for theft.\n\nWe will not pay for flood damage.";
    let b = "We will pay for theft.\n\nSubject to a survey being completed.";
    let result = compare(a, b);

    for m in &result.matches {
        let one_sided = m.a_id.is_none() || m.b_id.is_none();
        assert_eq!(m.similarity.is_none(), one_sided);
        assert_eq!(
            one_sided,
            matches!(m.status, MatchStatus::Added | MatchStatus::Removed)
        );
    }
}

#[test]
fn repeated_runs_are_byte_identical_modulo_timings() {
    let a = "1. COVERAGE\n\nWe will pay for theft of contents.\n\n2. EXCLUSIONS\n\nWe will not pay for flood damage.";
    let b = "1. COVERAGE\n\nWe will pay for theft of contents or stock.\n\n2. EXCLUSIONS\n\nTerrorism is excluded.";
    let pipeline = pipeline();
    let mut first = pipeline.compare(a.as_bytes(), b.as_bytes()).unwrap();
    let mut second = pipeline.compare(a.as_bytes(), b.as_bytes()).unwrap();
    first.timings_ms = Default::default();
    second.timings_ms = Default::default();
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_job_round_trip_produces_the_sync_result() {
    let a = "We will pay for theft of contents.\n\nWe will not pay for flood damage.";
    let b = "We will pay for theft of contents or stock.\n\nTerrorism is excluded.";

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            workers: 1,
            job_ttl: Duration::from_secs(60),
            ..OrchestratorConfig::default()
        },
        JobStore::open_in_memory().unwrap(),
        SegmentStore::open_in_memory().unwrap(),
        ProgressBus::new(),
        Arc::new(PlainTextSource),
    );
    let options = CompareOptions {
        embedder: EmbedderChoice::Local,
        ..CompareOptions::default()
    };
    let job = orchestrator
        .submit(
            a.as_bytes().to_vec(),
            Some("a.txt".into()),
            b.as_bytes().to_vec(),
            Some("b.txt".into()),
            options.clone(),
        )
        .await
        .unwrap();

    let mut done = None;
    for _ in 0..200 {
        let job = orchestrator.jobs().get(&job.job_id).await.unwrap().unwrap();
        if job.status.is_terminal() {
            done = Some(job);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let done = done.expect("job finished");
    assert_eq!(done.status, JobStatus::Completed);

    let mut stored = orchestrator
        .jobs()
        .get_result(&job.job_id)
        .await
        .unwrap()
        .unwrap();

    let sync_pipeline = Pipeline::new(
        options,
        Arc::new(HashedEmbedder::default()),
        Arc::new(PlainTextSource),
    );
    let mut sync = sync_pipeline.compare(a.as_bytes(), b.as_bytes()).unwrap();

    stored.timings_ms = Default::default();
    sync.timings_ms = Default::default();
    assert_eq!(stored, sync);
}
