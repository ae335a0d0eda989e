//! # Cross-Module Test Suite
//!
//! End-to-end runs of the worked sailing scenarios through the repository
//! and the gateway, plus invariants that must hold across modules.

mod scenario_tests;
