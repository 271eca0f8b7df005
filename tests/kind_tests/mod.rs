//! Integration tests for the weaver controller
//!
//! These tests require a Kubernetes cluster (kind) and tell the story of how
//! application teams interact with weaver.
//!
//! # Test Organization
//!
//! - `app_lifecycle`: Stories about an Application being compiled against its
//!   Base, edited, and deleted, with the controller running in-process
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod app_lifecycle;
mod helpers;
