// src/check.rs

//! Reference, device and gradient checks for operators.
//!
//! Each check builds the operator from its [`OperatorDef`], runs it on the
//! requested device(s) and compares the results elementwise. Any element
//! outside tolerance fails the check with [`CheckError::Mismatch`], which
//! names the first offending index and how many elements failed.

use log::{error, info, trace};
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::criterion::is_float;
use crate::device::DeviceOption;
use crate::error::{CheckError, CheckKind};
use crate::op::{grad_name, gradient_defs, OperatorDef, Workspace};

// --- Configuration ---

/// Elementwise closeness: `|actual - expected| <= atol + rtol * |expected|`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    pub fn new(atol: f64, rtol: f64) -> Self {
        Tolerance { atol, rtol }
    }

    /// Same absolute and relative tolerance.
    pub fn symmetric(threshold: f64) -> Self {
        Tolerance::new(threshold, threshold)
    }

    pub fn is_close(&self, actual: f64, expected: f64) -> bool {
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance::symmetric(1e-4)
    }
}

/// Settings for the finite-difference gradient check.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GradientTolerance {
    /// Used as both absolute and relative tolerance.
    pub threshold: f64,
    /// Central difference step.
    pub stepsize: f32,
}

impl Default for GradientTolerance {
    fn default() -> Self {
        GradientTolerance {
            threshold: 0.005,
            stepsize: 0.05,
        }
    }
}

/// Tolerances for all three checks.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub reference: Tolerance,
    pub device: f64,
    pub gradient: GradientTolerance,
}

impl Default for Tolerances {
    fn default() -> Self {
        Tolerances {
            reference: Tolerance::default(),
            device: 0.01,
            gradient: GradientTolerance::default(),
        }
    }
}

// --- Tensor helpers ---

/// Copies any tensor to a flat `Vec<f64>` on the CPU.
pub fn to_f64_vec(tensor: &Tensor) -> Result<Vec<f64>, CheckError> {
    let flat = tensor
        .f_to_device(Device::Cpu)?
        .f_to_kind(Kind::Double)?
        .f_flatten(0, -1)?
        .contiguous();
    Ok(Vec::<f64>::try_from(&flat)?)
}

pub fn to_f32_vec(tensor: &Tensor) -> Result<Vec<f32>, CheckError> {
    let flat = tensor
        .f_to_device(Device::Cpu)?
        .f_to_kind(Kind::Float)?
        .f_flatten(0, -1)?
        .contiguous();
    Ok(Vec::<f32>::try_from(&flat)?)
}

pub fn to_i32_vec(tensor: &Tensor) -> Result<Vec<i32>, CheckError> {
    let flat = tensor
        .f_to_device(Device::Cpu)?
        .f_to_kind(Kind::Int)?
        .f_flatten(0, -1)?
        .contiguous();
    Ok(Vec::<i32>::try_from(&flat)?)
}

fn place(inputs: &[Tensor], device: Device) -> Result<Vec<Tensor>, CheckError> {
    inputs
        .iter()
        .map(|t| t.f_to_device(device).map_err(CheckError::from))
        .collect()
}

/// Runs `op` on `device` in a fresh workspace and returns all its outputs.
pub fn run_on_device(
    op: &OperatorDef,
    inputs: &[Tensor],
    device: DeviceOption,
) -> Result<Vec<Tensor>, CheckError> {
    if op.inputs.len() != inputs.len() {
        return Err(CheckError::invalid_input(
            &op.op_type,
            format!(
                "descriptor names {} input(s), {} tensor(s) given",
                op.inputs.len(),
                inputs.len()
            ),
        ));
    }
    let mut ws = Workspace::new();
    for (name, tensor) in op.inputs.iter().zip(place(inputs, device.device())?) {
        ws.feed_blob(name, tensor);
    }
    ws.run_operator(op)?;
    op.outputs
        .iter()
        .map(|name| ws.fetch_blob(name).map(Tensor::shallow_clone))
        .collect()
}

/// Compares two tensors elementwise, failing on shape or value mismatch.
pub fn compare_tensors(
    check: CheckKind,
    what: &str,
    actual: &Tensor,
    expected: &Tensor,
    tolerance: &Tolerance,
) -> Result<(), CheckError> {
    if actual.size() != expected.size() {
        error!(
            "{} check: shape mismatch for {}: {:?} vs {:?}",
            check,
            what,
            actual.size(),
            expected.size()
        );
        return Err(CheckError::ShapeMismatch {
            check,
            what: what.to_string(),
            expected: expected.size(),
            found: actual.size(),
        });
    }
    compare_values(
        check,
        what,
        &to_f64_vec(actual)?,
        &to_f64_vec(expected)?,
        tolerance,
    )
}

fn compare_values(
    check: CheckKind,
    what: &str,
    actual: &[f64],
    expected: &[f64],
    tolerance: &Tolerance,
) -> Result<(), CheckError> {
    let mut first = None;
    let mut failures = 0;
    for (index, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        trace!("{} check {}[{}]: {} vs {}", check, what, index, a, e);
        if !tolerance.is_close(a, e) {
            failures += 1;
            first.get_or_insert((index, a, e));
        }
    }
    match first {
        None => Ok(()),
        Some((index, actual, expected)) => {
            error!(
                "{} check failed for {}: {} element(s) out of tolerance, first at {} ({} vs {})",
                check, what, failures, index, actual, expected
            );
            Err(CheckError::Mismatch {
                check,
                what: what.to_string(),
                index,
                expected,
                actual,
                failures,
            })
        }
    }
}

// --- Checks ---

/// Runs `op` on `gc` and compares its outputs with a reference function.
///
/// The reference must return exactly one tensor per operator output, in
/// operator output order.
///
/// # Arguments
///
/// * `gc` - The device the operator runs on.
/// * `op` - The operator descriptor.
/// * `inputs` - Input tensors, one per name in `op.inputs`.
/// * `reference` - Receives the inputs on the CPU and returns the expected outputs.
/// * `tolerance` - Elementwise closeness required of every output.
///
/// # Returns
///
/// `Ok(())` if every output matches. A `CheckError::OutputCountMismatch`,
/// `ShapeMismatch` or `Mismatch` otherwise.
pub fn assert_reference_checks<F>(
    gc: DeviceOption,
    op: &OperatorDef,
    inputs: &[Tensor],
    reference: F,
    tolerance: &Tolerance,
) -> Result<(), CheckError>
where
    F: Fn(&[Tensor]) -> Result<Vec<Tensor>, CheckError>,
{
    info!("Reference check for {} on {}", op.op_type, gc);
    let outputs = run_on_device(op, inputs, gc)?;
    let cpu_inputs = place(inputs, Device::Cpu)?;
    let expected = reference(&cpu_inputs)?;
    if expected.len() != outputs.len() {
        error!(
            "Reference check for {}: reference returned {} output(s), operator produced {}",
            op.op_type,
            expected.len(),
            outputs.len()
        );
        return Err(CheckError::OutputCountMismatch {
            check: CheckKind::Reference,
            expected: outputs.len(),
            found: expected.len(),
        });
    }
    for (index, (actual, expected)) in outputs.iter().zip(&expected).enumerate() {
        let what = op
            .outputs
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("output {}", index));
        compare_tensors(CheckKind::Reference, &what, actual, expected, tolerance)?;
    }
    info!("Reference check for {} passed", op.op_type);
    Ok(())
}

/// Runs `op` on every device in `dc` and compares the listed outputs
/// against the first device.
///
/// # Arguments
///
/// * `dc` - Devices to compare. The first one is the baseline.
/// * `op` - The operator descriptor.
/// * `inputs` - Input tensors, moved to each device in turn.
/// * `outputs_to_check` - Indices of the outputs to compare.
/// * `threshold` - Used as both absolute and relative tolerance.
///
/// # Returns
///
/// `Ok(())` if all devices agree, `Ok(())` trivially for an empty `dc`.
pub fn assert_device_checks(
    dc: &[DeviceOption],
    op: &OperatorDef,
    inputs: &[Tensor],
    outputs_to_check: &[usize],
    threshold: f64,
) -> Result<(), CheckError> {
    let Some((&baseline_device, others)) = dc.split_first() else {
        return Ok(());
    };
    info!(
        "Device check for {} across {} device(s)",
        op.op_type,
        dc.len()
    );
    let tolerance = Tolerance::symmetric(threshold);
    let baseline = run_on_device(op, inputs, baseline_device)?;
    for &device in others {
        let outputs = run_on_device(op, inputs, device)?;
        for &index in outputs_to_check {
            let (Some(expected), Some(actual)) = (baseline.get(index), outputs.get(index)) else {
                return Err(CheckError::MissingOutput {
                    index,
                    produced: baseline.len().min(outputs.len()),
                });
            };
            trace!("Comparing output {} on {} against {}", index, device, baseline_device);
            let what = format!("output {} on {} vs {}", index, device, baseline_device);
            compare_tensors(CheckKind::Device, &what, actual, expected, &tolerance)?;
        }
    }
    info!("Device check for {} passed", op.op_type);
    Ok(())
}

/// Runs `op` and its gradient operators on `device` with
/// loss = 1/2 * sum(output^2) over `outputs_with_grads`.
///
/// Returns the loss and the gradient of `inputs[input_to_check]`.
fn loss_and_grad(
    op: &OperatorDef,
    grad_ops: &[OperatorDef],
    inputs: &[Tensor],
    input_to_check: usize,
    outputs_with_grads: &[usize],
    device: DeviceOption,
    want_grad: bool,
) -> Result<(f64, Option<Tensor>), CheckError> {
    let mut ws = Workspace::new();
    for (name, tensor) in op.inputs.iter().zip(place(inputs, device.device())?) {
        ws.feed_blob(name, tensor);
    }
    ws.run_operator(op)?;

    let mut loss = 0.0;
    for (index, name) in op.outputs.iter().enumerate() {
        let output = ws.fetch_blob(name)?.shallow_clone();
        let output_grad = if outputs_with_grads.contains(&index) {
            loss += to_f64_vec(&output)?.iter().map(|v| v * v).sum::<f64>();
            output.shallow_clone()
        } else {
            output.f_zeros_like()?
        };
        ws.feed_blob(&grad_name(name), output_grad);
    }
    loss /= 2.0;

    if !want_grad {
        return Ok((loss, None));
    }
    for grad_op in grad_ops {
        ws.run_operator(grad_op)?;
    }
    let input_grad = ws
        .fetch_blob(&grad_name(&op.inputs[input_to_check]))?
        .shallow_clone();
    Ok((loss, Some(input_grad)))
}

/// Compares the analytic gradient of `inputs[input_to_check]` with a
/// central-difference estimate.
///
/// The loss is `1/2 * sum(output^2)` over `outputs_with_grads`, so each
/// output gradient fed to the gradient operators is the output itself.
///
/// # Arguments
///
/// * `gc` - The device both passes run on.
/// * `op` - The forward operator; its gradient comes from `gradient_defs`.
/// * `inputs` - Input tensors. The checked one must be floating point.
/// * `input_to_check` - Index of the input to differentiate.
/// * `outputs_with_grads` - Indices of the outputs that contribute to the loss.
/// * `tolerance` - Threshold and central-difference step.
///
/// # Returns
///
/// `Ok(())` if every element of the gradient matches, a
/// `CheckError::Mismatch` tagged `Gradient` otherwise.
pub fn assert_gradient_checks(
    gc: DeviceOption,
    op: &OperatorDef,
    inputs: &[Tensor],
    input_to_check: usize,
    outputs_with_grads: &[usize],
    tolerance: &GradientTolerance,
) -> Result<(), CheckError> {
    info!(
        "Gradient check for {} on {}: input {} from outputs {:?}",
        op.op_type, gc, input_to_check, outputs_with_grads
    );
    if input_to_check >= inputs.len() || input_to_check >= op.inputs.len() {
        return Err(CheckError::invalid_input(
            &op.op_type,
            format!("no input {} to check", input_to_check),
        ));
    }
    if let Some(&index) = outputs_with_grads.iter().find(|&&i| i >= op.outputs.len()) {
        return Err(CheckError::MissingOutput {
            index,
            produced: op.outputs.len(),
        });
    }
    let checked = &inputs[input_to_check];
    let shape = checked.size();
    let kind = checked.kind();
    if !is_float(kind) {
        return Err(CheckError::invalid_input(
            &op.op_type,
            format!("cannot differentiate input {} of kind {:?}", input_to_check, kind),
        ));
    }
    let grad_ops = gradient_defs(op)?;

    let (_, analytic) = loss_and_grad(
        op,
        &grad_ops,
        inputs,
        input_to_check,
        outputs_with_grads,
        gc,
        true,
    )?;
    let analytic = match analytic {
        Some(grad) => to_f64_vec(&grad)?,
        None => return Err(CheckError::MissingBlob(grad_name(&op.inputs[input_to_check]))),
    };

    let mut values = to_f32_vec(checked)?;
    let step = tolerance.stepsize;

    let mut trial_inputs: Vec<Tensor> = inputs.iter().map(Tensor::shallow_clone).collect();
    let mut estimate = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let original = values[i];
        let (plus, minus) = (original + step, original - step);

        values[i] = plus;
        trial_inputs[input_to_check] = Tensor::from_slice(&values)
            .f_reshape(&shape)?
            .f_to_kind(kind)?;
        let (pos_loss, _) = loss_and_grad(
            op,
            &grad_ops,
            &trial_inputs,
            input_to_check,
            outputs_with_grads,
            gc,
            false,
        )?;

        values[i] = minus;
        trial_inputs[input_to_check] = Tensor::from_slice(&values)
            .f_reshape(&shape)?
            .f_to_kind(kind)?;
        let (neg_loss, _) = loss_and_grad(
            op,
            &grad_ops,
            &trial_inputs,
            input_to_check,
            outputs_with_grads,
            gc,
            false,
        )?;

        values[i] = original;
        estimate.push((pos_loss - neg_loss) / (plus as f64 - minus as f64));
    }

    let what = format!("d(loss)/d({})", op.inputs[input_to_check]);
    compare_values(
        CheckKind::Gradient,
        &what,
        &analytic,
        &estimate,
        &Tolerance::symmetric(tolerance.threshold),
    )?;
    info!("Gradient check for {} passed", op.op_type);
    Ok(())
}

// -------------------- Tests --------------------
