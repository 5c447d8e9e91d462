#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

mod unit {
    #[path = "../integration/support.rs"]
    mod support;

    mod router_concurrency_tests;
}
