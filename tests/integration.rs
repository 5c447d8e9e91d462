#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

mod integration {
    mod support;

    mod buffer_fallback_tests;
    mod file_routing_tests;
    mod hook_round_trip_tests;
    mod multi_instance_routing_tests;
    mod session_missing_tests;
    mod supervisor_restart_tests;
}
