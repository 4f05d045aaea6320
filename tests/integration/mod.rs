//! Integration test suite for foreman.
//!
//! These tests exercise the full scheduling loop from batch intake to
//! the review report, including lock contention, dependency gating,
//! retry/backoff, and escalation handling.
//!
//! # Test Categories
//!
//! - `intake`: batch file parsing and enqueue validation
//! - `scenarios`: end-to-end scheduling scenarios
//! - `invariants`: properties that must hold on every tick
//! - `recovery`: fault injection, stall detection, and escalation
//!
//! # CI Compatibility
//!
//! All executors and gates are scripted in-process; no external agents
//! or tools are invoked, making the suite safe to run in CI.

mod fixtures;

mod invariants;
mod recovery;
