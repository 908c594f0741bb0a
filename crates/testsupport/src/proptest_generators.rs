//! Property-based test generators using proptest.
//!
//! Keys come from a small alphabet so generated logs overwrite and delete
//! the same keys often.

use crate::fixtures::ALL_MACHINES;
use kv::Command;
use proptest::prelude::*;

pub fn arb_key() -> impl Strategy<Value = String> {
    "[a-e]{1,2}"
}

/// Strategy for generating key/value commands, mostly sets.
pub fn arb_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        3 => (arb_key(), "[a-z0-9]{0,6}").prop_map(|(key, value)| Command::set(key, value)),
        1 => arb_key().prop_map(Command::delete),
    ]
}

/// Encoded commands, with the occasional malformed one.
pub fn arb_cmd_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        9 => arb_command().prop_map(|command| command.encode()),
        1 => prop::collection::vec(any::<u8>(), 0..8),
    ]
}

/// A log of `1..max_len` commands.
///
/// # Example
///
/// ```
/// use proptest::prelude::*;
/// use testsupport::proptest_generators::arb_log;
///
/// proptest! {
///     #[test]
///     fn logs_are_never_empty(log in arb_log(10)) {
///         assert!(!log.is_empty());
///     }
/// }
/// ```
pub fn arb_log(max_len: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(arb_cmd_bytes(), 1..max_len.max(2))
}

/// A log cut into non-empty batches.
pub fn arb_batches() -> impl Strategy<Value = Vec<Vec<Vec<u8>>>> {
    prop::collection::vec(prop::collection::vec(arb_cmd_bytes(), 1..6), 1..6)
}

/// A log and a split point inside it.
pub fn arb_log_with_split(max_len: usize) -> impl Strategy<Value = (Vec<Vec<u8>>, usize)> {
    arb_log(max_len).prop_flat_map(|log| {
        let len = log.len();
        (Just(log), 0..=len)
    })
}

/// Name of a registered key/value machine.
pub fn arb_machine() -> impl Strategy<Value = &'static str> {
    prop::sample::select(ALL_MACHINES.to_vec())
}
