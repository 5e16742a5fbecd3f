// SPDX-License-Identifier: MIT

//! # Erlay Common
//! Shared primitives for Erlay-style transaction reconciliation: the keyed
//! short-ID hasher used to compare transaction sets across peers, and the
//! estimator for the expected set-difference density used to size sketches.

pub mod estimator;
pub mod short_id;

pub use estimator::DiffEstimator;
pub use short_id::combine_salts;
pub use short_id::ShortIdHasher;
