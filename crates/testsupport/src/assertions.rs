//! Custom assertion helpers for testing.

use common::{SmError, SmResult};
use rsm::Host;

/// Assert that `key` reads back as `expected`.
pub async fn assert_value(host: &Host, key: &str, expected: &str) {
    let result = host
        .lookup(key.as_bytes())
        .await
        .unwrap_or_else(|e| panic!("lookup of {key:?} on {} failed: {e}", host.replica()));
    assert_eq!(
        result.as_bytes(),
        expected.as_bytes(),
        "value of {key:?} on {}",
        host.replica()
    );
}

/// Assert that `key` is absent.
pub async fn assert_missing(host: &Host, key: &str) {
    match host.lookup(key.as_bytes()).await {
        Err(SmError::Query(_)) => {}
        Ok(result) => panic!(
            "expected {key:?} to be missing on {}, found {:?}",
            host.replica(),
            String::from_utf8_lossy(result.as_bytes())
        ),
        Err(e) => panic!("lookup of {key:?} on {} failed: {e}", host.replica()),
    }
}

/// Assert that two hosts sit at the same index with the same state hash.
pub async fn assert_same_state(left: &Host, right: &Host) {
    assert_eq!(
        left.applied_index(),
        right.applied_index(),
        "applied index of {} and {}",
        left.replica(),
        right.replica()
    );
    let left_hash = left.hash().await.expect("hash left");
    let right_hash = right.hash().await.expect("hash right");
    assert_eq!(
        left_hash,
        right_hash,
        "state hash of {} and {}",
        left.replica(),
        right.replica()
    );
}

/// Assert that an operation failed with a fatal error and the host halted.
pub fn assert_fatal<T: std::fmt::Debug>(host: &Host, result: SmResult<T>) {
    let err = result.expect_err("expected a fatal error");
    assert!(err.is_fatal(), "expected a fatal error, got {err}");
    assert!(host.is_halted(), "{} should have halted", host.replica());
}

/// Assert that an operation failed without halting the host.
pub fn assert_recoverable<T: std::fmt::Debug>(host: &Host, result: SmResult<T>) -> SmError {
    let err = result.expect_err("expected an error");
    assert!(!err.is_fatal(), "expected a recoverable error, got {err}");
    assert!(!host.is_halted(), "{} should still be serving", host.replica());
    err
}
