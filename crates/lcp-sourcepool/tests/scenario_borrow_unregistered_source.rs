//! Borrowing from a `source_code` that was never registered must fail with
//! `SourceUnavailable` before any connection attempt.

use lcp_sourcepool::{SourcePoolError, SourcePoolRegistry};
use std::time::Duration;

#[tokio::test]
async fn borrow_unknown_source_code_is_source_unavailable() {
    let registry = SourcePoolRegistry::new(vec![]).await.expect("empty registry builds");

    let err = registry
        .borrow("NEVER_REGISTERED", Duration::from_millis(50))
        .await
        .expect_err("unregistered source must fail");

    match err {
        SourcePoolError::SourceUnavailable { source_code, .. } => {
            assert_eq!(source_code, "NEVER_REGISTERED");
        }
        other => panic!("expected SourceUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn verify_read_only_on_unknown_source_code_is_source_unavailable() {
    let registry = SourcePoolRegistry::new(vec![]).await.expect("empty registry builds");

    let err = registry
        .verify_read_only("NEVER_REGISTERED")
        .await
        .expect_err("unregistered source must fail");

    assert!(matches!(err, SourcePoolError::SourceUnavailable { .. }));
}
