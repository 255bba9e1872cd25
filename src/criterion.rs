// src/criterion.rs

//! The cosine embedding criterion and its gradient.
//!
//! Given similarity scores `S` and labels `Y` in {-1, +1}, the loss is
//! computed elementwise:
//!
//! - `1 - S[i]` where `Y[i] == 1`,
//! - `max(S[i] - margin, 0)` otherwise.
//!
//! The loss has a kink at `S == margin` on the negative branch; the gradient
//! kernel uses the subgradient 1 there.

use log::trace;
use tch::{Kind, Tensor};

use crate::error::CheckError;
use crate::op::{Operator, OperatorDef};

pub const COSINE_EMBEDDING_CRITERION: &str = "CosineEmbeddingCriterion";
pub const COSINE_EMBEDDING_CRITERION_GRADIENT: &str = "CosineEmbeddingCriterionGradient";

pub(crate) fn is_float(kind: Kind) -> bool {
    matches!(kind, Kind::Half | Kind::BFloat16 | Kind::Float | Kind::Double)
}

fn is_integer(kind: Kind) -> bool {
    matches!(
        kind,
        Kind::Uint8 | Kind::Int8 | Kind::Int16 | Kind::Int | Kind::Int64
    )
}

fn validate_pair(op: &str, scores: &Tensor, labels: &Tensor) -> Result<(), CheckError> {
    if scores.dim() != 1 {
        return Err(CheckError::invalid_input(
            op,
            format!("S must be 1-D, got shape {:?}", scores.size()),
        ));
    }
    if scores.size() != labels.size() {
        return Err(CheckError::invalid_input(
            op,
            format!(
                "S and Y must have the same shape, got {:?} and {:?}",
                scores.size(),
                labels.size()
            ),
        ));
    }
    if !is_float(scores.kind()) {
        return Err(CheckError::invalid_input(
            op,
            format!("S must be floating point, got {:?}", scores.kind()),
        ));
    }
    if !is_integer(labels.kind()) {
        return Err(CheckError::invalid_input(
            op,
            format!("Y must be integer, got {:?}", labels.kind()),
        ));
    }
    if scores.device() != labels.device() {
        return Err(CheckError::invalid_input(
            op,
            format!(
                "S and Y must live on the same device, got {:?} and {:?}",
                scores.device(),
                labels.device()
            ),
        ));
    }
    Ok(())
}

/// Elementwise loss computed on plain slices.
///
/// This is the formula the tensor kernel is checked against. Only labels 1
/// and -1 contribute; any other label yields 0.
pub fn reference_output(scores: &[f32], labels: &[i32], margin: f32) -> Vec<f32> {
    scores
        .iter()
        .zip(labels)
        .map(|(&s, &y)| match y {
            1 => 1.0 - s,
            -1 => (s - margin).max(0.0),
            _ => 0.0,
        })
        .collect()
}

/// Forward kernel: inputs `[S, Y]`, output `[loss]`.
#[derive(Debug, Clone)]
pub struct CosineEmbeddingCriterion {
    margin: f32,
}

impl CosineEmbeddingCriterion {
    pub fn new(margin: f32) -> Self {
        CosineEmbeddingCriterion { margin }
    }

    pub fn from_def(def: &OperatorDef) -> Result<Self, CheckError> {
        def.expect_arity(2, 1)?;
        Ok(Self::new(def.get_arg_f32("margin", 0.0)))
    }

    pub fn forward(&self, scores: &Tensor, labels: &Tensor) -> Result<Tensor, CheckError> {
        validate_pair(COSINE_EMBEDDING_CRITERION, scores, labels)?;
        let positive = labels.f_eq(1i64)?;
        let matched = scores.f_neg()?.f_add_scalar(1.0)?;
        let mismatched = scores
            .f_sub_scalar(self.margin as f64)?
            .f_clamp_min(0.0)?;
        Ok(matched.f_where_self(&positive, &mismatched)?)
    }
}

impl Operator for CosineEmbeddingCriterion {
    fn op_type(&self) -> &str {
        COSINE_EMBEDDING_CRITERION
    }

    fn run(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, CheckError> {
        let [scores, labels] = inputs else {
            return Err(CheckError::invalid_input(
                COSINE_EMBEDDING_CRITERION,
                format!("expected 2 inputs, got {}", inputs.len()),
            ));
        };
        trace!(
            "{} forward: n={}, margin={}, device={:?}",
            COSINE_EMBEDDING_CRITERION,
            scores.numel(),
            self.margin,
            scores.device()
        );
        Ok(vec![self.forward(scores, labels)?])
    }
}

/// Gradient kernel: inputs `[S, Y, dOutput]`, output `[dS]`.
///
/// `dS[i] = dOutput[i] * (-1 if Y[i] == 1 else [S[i] >= margin])`
#[derive(Debug, Clone)]
pub struct CosineEmbeddingCriterionGradient {
    margin: f32,
}

impl CosineEmbeddingCriterionGradient {
    pub fn new(margin: f32) -> Self {
        CosineEmbeddingCriterionGradient { margin }
    }

    pub fn from_def(def: &OperatorDef) -> Result<Self, CheckError> {
        def.expect_arity(3, 1)?;
        Ok(Self::new(def.get_arg_f32("margin", 0.0)))
    }

    pub fn backward(
        &self,
        scores: &Tensor,
        labels: &Tensor,
        output_grad: &Tensor,
    ) -> Result<Tensor, CheckError> {
        validate_pair(COSINE_EMBEDDING_CRITERION_GRADIENT, scores, labels)?;
        if output_grad.size() != scores.size() {
            return Err(CheckError::invalid_input(
                COSINE_EMBEDDING_CRITERION_GRADIENT,
                format!(
                    "dOutput must match S, got {:?} and {:?}",
                    output_grad.size(),
                    scores.size()
                ),
            ));
        }
        let positive = labels.f_eq(1i64)?;
        let active = scores
            .f_ge(self.margin as f64)?
            .f_to_kind(scores.kind())?;
        let negative_one = scores.f_ones_like()?.f_neg()?;
        let factor = negative_one.f_where_self(&positive, &active)?;
        Ok(output_grad.f_to_kind(scores.kind())?.f_mul(&factor)?)
    }
}

impl Operator for CosineEmbeddingCriterionGradient {
    fn op_type(&self) -> &str {
        COSINE_EMBEDDING_CRITERION_GRADIENT
    }

    fn run(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, CheckError> {
        let [scores, labels, output_grad] = inputs else {
            return Err(CheckError::invalid_input(
                COSINE_EMBEDDING_CRITERION_GRADIENT,
                format!("expected 3 inputs, got {}", inputs.len()),
            ));
        };
        Ok(vec![self.backward(scores, labels, output_grad)?])
    }
}

// -------------------- Tests --------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tch::Device;

    const EPSILON: f32 = 1e-6;

    fn assert_slice_eq(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len(), "Length mismatch");
        for (a, e) in actual.iter().zip(expected) {
            assert_abs_diff_eq!(*a, *e, epsilon = EPSILON);
        }
    }

    #[test]
    fn test_reference_output() {
        let out = reference_output(&[0.5, -0.2, 0.3, 0.9], &[1, -1, -1, 1], 0.1);
        assert_slice_eq(&out, &[0.5, 0.0, 0.2, 0.1]);

        let out = reference_output(&[0.5, 0.7, 0.7], &[0, 2, -2], 0.1);
        assert_slice_eq(&out, &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_forward() -> Result<(), CheckError> {
        let op = CosineEmbeddingCriterion::new(0.1);
        let scores = Tensor::from_slice(&[0.5f32, -0.2, 0.3, 0.9, 1.7]);
        let labels = Tensor::from_slice(&[1i32, -1, -1, 1, 1]);
        let out = op.forward(&scores, &labels)?;
        assert_eq!(out.size(), &[5i64]);
        assert_eq!(out.kind(), Kind::Float);
        // Positive labels are not clamped: 1 - 1.7 stays negative.
        assert_slice_eq(&Vec::<f32>::try_from(&out)?, &[0.5, 0.0, 0.2, 0.1, -0.7]);
        Ok(())
    }

    #[test]
    fn test_forward_matches_reference_at_margin_extremes() -> Result<(), CheckError> {
        let s = [-1.2f32, -0.5, -0.1, 0.0, 0.4, 0.5, 0.6, 2.0];
        let y = [-1i32, -1, -1, -1, -1, -1, -1, 1];
        for margin in [-0.5f32, 0.5] {
            let op = CosineEmbeddingCriterion::new(margin);
            let out = op.forward(&Tensor::from_slice(&s), &Tensor::from_slice(&y))?;
            assert_slice_eq(
                &Vec::<f32>::try_from(&out)?,
                &reference_output(&s, &y, margin),
            );
        }
        Ok(())
    }

    #[test]
    fn test_backward() -> Result<(), CheckError> {
        let op = CosineEmbeddingCriterionGradient::new(0.0);
        let scores = Tensor::from_slice(&[0.5f32, -0.2, 0.3, 0.0]);
        let labels = Tensor::from_slice(&[1i32, -1, -1, -1]);
        let output_grad = Tensor::from_slice(&[1.0f32, 1.0, 2.0, 3.0]);
        let grad = op.backward(&scores, &labels, &output_grad)?;
        // S == margin takes the subgradient 1.
        assert_slice_eq(&Vec::<f32>::try_from(&grad)?, &[-1.0, 0.0, 2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_from_def() -> Result<(), CheckError> {
        let def = OperatorDef::new(COSINE_EMBEDDING_CRITERION, ["S", "Y"], ["output"]);
        let op = CosineEmbeddingCriterion::from_def(&def)?;
        // No margin argument means margin 0: a negative pair at 0.3 costs 0.3.
        let out = op.forward(&Tensor::from_slice(&[0.3f32]), &Tensor::from_slice(&[-1i32]))?;
        assert_slice_eq(&Vec::<f32>::try_from(&out)?, &[0.3]);

        let bad = OperatorDef::new(COSINE_EMBEDDING_CRITERION, ["S"], ["output"]);
        assert!(matches!(
            CosineEmbeddingCriterion::from_def(&bad),
            Err(CheckError::InvalidInput { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_inputs() {
        let op = CosineEmbeddingCriterion::new(0.0);
        let scores = Tensor::from_slice(&[0.5f32, 0.1]);

        let short_labels = Tensor::from_slice(&[1i32]);
        assert!(op.forward(&scores, &short_labels).is_err());

        let float_labels = Tensor::from_slice(&[1.0f32, -1.0]);
        assert!(op.forward(&scores, &float_labels).is_err());

        let int_scores = Tensor::from_slice(&[1i32, 0]);
        let labels = Tensor::from_slice(&[1i32, -1]);
        assert!(op.forward(&int_scores, &labels).is_err());

        let matrix = Tensor::zeros(&[2, 2], (Kind::Float, Device::Cpu));
        let matrix_labels = Tensor::ones(&[2, 2], (Kind::Int, Device::Cpu));
        assert!(op.forward(&matrix, &matrix_labels).is_err());

        assert!(matches!(
            op.run(&[scores]),
            Err(CheckError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_backward_rejects_mismatched_output_grad() {
        let op = CosineEmbeddingCriterionGradient::new(0.0);
        let scores = Tensor::from_slice(&[0.5f32, 0.1]);
        let labels = Tensor::from_slice(&[1i32, -1]);
        let output_grad = Tensor::from_slice(&[1.0f32]);
        assert!(op.backward(&scores, &labels, &output_grad).is_err());
    }
}
