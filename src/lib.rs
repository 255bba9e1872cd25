// src/lib.rs

//! Reference-checked tensor operators on libtorch.
//!
//! The crate holds a small operator engine ([`op`]) with the cosine
//! embedding criterion and its gradient ([`criterion`]), plus the checks
//! used to verify operators: reference equivalence, cross-device
//! agreement and finite-difference gradients ([`check`]). Randomized trials
//! ([`trial`]) drive all three checks, and failing trials can be kept for
//! replay ([`database`]).

pub mod check;
pub mod criterion;
pub mod database;
pub mod device;
pub mod error;
pub mod op;
pub mod trial;

pub use check::{
    assert_device_checks, assert_gradient_checks, assert_reference_checks, GradientTolerance,
    Tolerance, Tolerances,
};
pub use criterion::{CosineEmbeddingCriterion, CosineEmbeddingCriterionGradient};
pub use database::TrialDatabase;
pub use device::{available_devices, gcs, DeviceOption};
pub use error::{CheckError, CheckKind};
pub use op::{create_operator, gradient_defs, ArgValue, Operator, OperatorDef, Workspace};
pub use trial::{run_trial, Trial, TrialParams};
