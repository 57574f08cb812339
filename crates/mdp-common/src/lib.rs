//! MDP Common Library
//!
//! Shared error handling, logging, and content fingerprints for the MDP
//! market-data pipeline.
//!
//! # Overview
//!
//! - **Error Handling**: [`MdpError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Fingerprints**: stable content hashes of JSON documents
//!
//! # Example
//!
//! ```no_run
//! use mdp_common::fingerprint::fingerprint_json;
//!
//! let value = serde_json::json!({"instrument_id": 42, "close": "101.25"});
//! let digest = fingerprint_json(&value).unwrap();
//! assert_eq!(digest.len(), 64);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod fingerprint;
pub mod logging;

// Re-export commonly used types
pub use error::{MdpError, Result};
