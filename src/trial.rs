// src/trial.rs

//! Randomized trials for the cosine embedding criterion.
//!
//! A trial is fully determined by its [`TrialParams`]: the scores are drawn
//! from a standard normal and the labels uniformly from {-1, +1}, both from
//! a ChaCha generator seeded with `seed`. Running the same parameters twice
//! yields the same inputs and the same outcome.

use log::{error, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::check::{
    assert_device_checks, assert_gradient_checks, assert_reference_checks, to_f32_vec,
    to_i32_vec, Tolerances,
};
use crate::criterion::{reference_output, COSINE_EMBEDDING_CRITERION};
use crate::device::DeviceOption;
use crate::error::CheckError;
use crate::op::{ArgValue, OperatorDef};

pub const MIN_N: usize = 10;
pub const MAX_N: usize = 20;
pub const MAX_SEED: u64 = 65535;
pub const MARGIN_RANGE: (f32, f32) = (-0.5, 0.5);

/// Scores closer than this to the margin are moved before gradient checks.
pub const KINK_RADIUS: f32 = 0.1;
pub const KINK_NUDGE: f32 = 0.2;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TrialParams {
    pub n: usize,
    pub seed: u64,
    pub margin: f32,
}

impl TrialParams {
    pub fn new(n: usize, seed: u64, margin: f32) -> Self {
        TrialParams { n, seed, margin }
    }

    pub fn sample(&self) -> Trial {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let scores: Vec<f32> = (0..self.n)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        let labels: Vec<i32> = (0..self.n)
            .map(|_| if rng.gen_bool(0.5) { 1 } else { -1 })
            .collect();
        Trial {
            params: *self,
            scores,
            labels,
        }
    }

    /// The criterion descriptor: `S, Y -> output` with this trial's margin.
    pub fn op_def(&self) -> OperatorDef {
        OperatorDef::new(COSINE_EMBEDDING_CRITERION, ["S", "Y"], ["output"])
            .arg("margin", ArgValue::Float(self.margin))
    }
}

/// Sampled inputs of one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub params: TrialParams,
    pub scores: Vec<f32>,
    pub labels: Vec<i32>,
}

impl Trial {
    /// `[S, Y]` as CPU tensors.
    pub fn inputs(&self) -> Vec<Tensor> {
        vec![
            Tensor::from_slice(&self.scores),
            Tensor::from_slice(&self.labels),
        ]
    }

    /// Copy of this trial with every score within [`KINK_RADIUS`] of the
    /// margin shifted up by [`KINK_NUDGE`].
    pub fn nudge_off_kink(&self) -> Trial {
        let margin = self.params.margin;
        let scores = self
            .scores
            .iter()
            .map(|&s| {
                if (s - margin).abs() < KINK_RADIUS {
                    s + KINK_NUDGE
                } else {
                    s
                }
            })
            .collect();
        Trial {
            params: self.params,
            scores,
            labels: self.labels.clone(),
        }
    }
}

/// Reference for the criterion with the given margin, over `[S, Y]` tensors.
pub fn ref_cec(margin: f32) -> impl Fn(&[Tensor]) -> Result<Vec<Tensor>, CheckError> {
    move |inputs: &[Tensor]| -> Result<Vec<Tensor>, CheckError> {
        let [scores, labels] = inputs else {
            return Err(CheckError::invalid_input(
                "ref_cec",
                format!("expected 2 inputs, got {}", inputs.len()),
            ));
        };
        let s = to_f32_vec(scores)?;
        let y = to_i32_vec(labels)?;
        Ok(vec![Tensor::from_slice(&reference_output(&s, &y, margin))])
    }
}

/// Runs the reference, device and gradient checks for one trial.
///
/// Value and device checks see the sampled inputs; the gradient check sees
/// the nudged copy. The first failing check ends the trial.
///
/// # Arguments
///
/// * `params` - Size, seed and margin of the trial.
/// * `gc` - Device for the reference and gradient checks.
/// * `dc` - Devices compared by the device check.
/// * `tolerances` - Tolerances for all three checks.
///
/// # Returns
///
/// `Ok(())` if all three checks pass, otherwise the first check's error.
pub fn run_trial(
    params: &TrialParams,
    gc: DeviceOption,
    dc: &[DeviceOption],
    tolerances: &Tolerances,
) -> Result<(), CheckError> {
    info!(
        "Trial n={} seed={} margin={} on {}",
        params.n, params.seed, params.margin, gc
    );
    let trial = params.sample();
    let op = params.op_def();
    let inputs = trial.inputs();

    let result = assert_reference_checks(
        gc,
        &op,
        &inputs,
        ref_cec(params.margin),
        &tolerances.reference,
    )
    .and_then(|()| assert_device_checks(dc, &op, &inputs, &[0], tolerances.device))
    .and_then(|()| {
        let nudged = trial.nudge_off_kink().inputs();
        assert_gradient_checks(gc, &op, &nudged, 0, &[0], &tolerances.gradient)
    });

    if let Err(e) = &result {
        error!("Trial {:?} failed: {}", params, e);
    }
    result
}

// -------------------- Tests --------------------
