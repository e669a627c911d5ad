//! Runtime checks of the stream invariants.
//!
//! The serializer asserts the properties a decoder relies on (monotonic SCR,
//! fixed packet size, SCR ahead of every timestamp) as it writes. Each check
//! is recorded in a thread-local log so tests can verify that a scenario
//! actually exercised it:
//!
//! ```rust,ignore
//! assert_invariant!(scr >= last_scr, "SCR is non-decreasing", "pack");
//!
//! #[test]
//! fn contract_packs() {
//!     // ... mux something ...
//!     contract_test("packs", &["SCR is non-decreasing"]);
//! }
//! ```
//!
//! A violation is logged at error level. Debug builds panic.

use std::cell::RefCell;
use std::collections::HashSet;
use std::thread_local;

thread_local! {
    static INVARIANT_LOG: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

#[macro_export]
macro_rules! assert_invariant {
    ($condition:expr, $message:expr) => {
        $crate::invariant::__assert_invariant_impl($condition, $message, None)
    };
    ($condition:expr, $message:expr, $context:expr) => {
        $crate::invariant::__assert_invariant_impl($condition, $message, Some($context))
    };
}

#[doc(hidden)]
pub fn __assert_invariant_impl(condition: bool, message: &str, context: Option<&str>) {
    INVARIANT_LOG.with(|log| {
        let mut log = log.borrow_mut();
        if !log.contains(message) {
            log.insert(message.to_string());
        }
    });

    if !condition {
        let ctx = context.unwrap_or("unknown");
        tracing::error!(context = ctx, "invariant violated: {message}");
        if cfg!(debug_assertions) {
            panic!("INVARIANT VIOLATION [{}]: {}", ctx, message);
        }
    }
}

/// Panics unless every listed invariant was checked on this thread.
pub fn contract_test(test_name: &str, required_invariants: &[&str]) {
    let log = INVARIANT_LOG.with(|log| log.borrow().clone());
    let missing: Vec<&str> = required_invariants
        .iter()
        .copied()
        .filter(|inv| !log.contains(*inv))
        .collect();
    if !missing.is_empty() {
        panic!(
            "CONTRACT FAILURE [{}]: The following invariants were not checked:\n  - {}",
            test_name,
            missing.join("\n  - ")
        );
    }
}

pub fn clear_invariant_log() {
    INVARIANT_LOG.with(|log| log.borrow_mut().clear());
}

pub fn checked_invariants() -> Vec<String> {
    INVARIANT_LOG.with(|log| log.borrow().iter().cloned().collect())
}
