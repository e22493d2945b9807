// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the vm-storage-coordinator.
//!
//! These tests verify the resize tolerance band, restore lifecycle and
//! clone validation WITHOUT requiring a live Kubernetes cluster. The guest
//! channel is mocked and the restore lifecycle is driven through the
//! production state machine.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_restore_parks_until_vm_stops
//!
//! # Run with verbose output
//! cargo test --test functional -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! - **Resize tests**: tolerance band and wait behavior against a mock guest
//! - **Restore tests**: full lifecycle scenarios via the production
//!   `determine_event` and transition table
//! - **Clone tests**: tiered admission policies
//!
//! ## Design Principles
//!
//! - **No K8s Required**: Tests run without any cluster infrastructure
//! - **Fast Execution**: Waits run under tokio's paused clock
//! - **Production Logic**: Event determination and guards are the real
//!   implementations, not test re-implementations

mod clone_tests;
mod mock_guest;
mod resize_tests;
mod restore_tests;

// Re-export for use in tests
pub use mock_guest::*;
