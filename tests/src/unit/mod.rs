mod app_tests;
mod surface_tests;

use std::time::Duration;

pub(crate) fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

pub(crate) fn fast_policy() -> streamchat_core::BackoffPolicy {
    streamchat_core::BackoffPolicy {
        base: Duration::from_millis(1),
        cap: Duration::from_millis(4),
        max_attempts: 3,
    }
}
