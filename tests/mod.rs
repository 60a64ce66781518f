//! Integration test modules for insights_agent.
//!
//! These tests drive the public API end to end with fakes standing in for
//! the analysis service and the clock.

mod archive_tests;
mod proxy_tests;
mod upload_tests;
