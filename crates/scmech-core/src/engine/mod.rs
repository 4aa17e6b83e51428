//! Shared building blocks for every mechanism.
//!
//! This module provides:
//! - **errors**: Error taxonomy for mechanism calls
//! - **edge_key**: Canonical `(child, parents)` edge identities
//! - **priors**: Hyperparameter priors and the noise-variance floor
//! - **config**: Prior and ground-truth configuration with validation

pub mod config;
pub mod edge_key;
pub mod errors;
pub mod priors;
