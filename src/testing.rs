//! Test-only helpers.

use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT: AtomicUsize = AtomicUsize::new(0);

/// A resource-name prefix no other test (or test process) uses.
pub(crate) fn unique_prefix() -> String {
    let seq = NEXT.fetch_add(1, Ordering::SeqCst);
    format!("/fl_test_{}_{seq}", std::process::id())
}
