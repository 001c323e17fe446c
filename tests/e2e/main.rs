//! Scenario suites against a real server binary.
//!
//! These need the system under test installed (`SALTCORN_BIN` or `saltcorn`
//! on the PATH) with a database configured, so every test is
//! `#[ignore]`-marked; run them with `cargo test --test e2e -- --ignored
//! --test-threads 1`. The suites share one database, so they must not run
//! in parallel.

#![allow(dead_code)]


mod collab_tests;
