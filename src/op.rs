// src/op.rs

//! Operator descriptors, the operator registry and a named-blob workspace.
//!
//! An operator is described by an [`OperatorDef`]: a type name, the names of
//! the blobs it reads and writes, and named scalar arguments. The registry
//! turns a descriptor into a runnable [`Operator`]; a [`Workspace`] wires
//! blobs to operators by name so forward and gradient operators can be
//! chained the same way.

use std::collections::HashMap;

use log::trace;
use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::criterion::{
    CosineEmbeddingCriterion, CosineEmbeddingCriterionGradient, COSINE_EMBEDDING_CRITERION,
    COSINE_EMBEDDING_CRITERION_GRADIENT,
};
use crate::error::CheckError;

/// A scalar operator argument.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum ArgValue {
    Float(f32),
    Int(i64),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
}

/// Immutable description of one operator invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OperatorDef {
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub args: Vec<Argument>,
}

impl OperatorDef {
    pub fn new<I, O>(op_type: &str, inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        OperatorDef {
            op_type: op_type.to_string(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            args: Vec::new(),
        }
    }

    /// Adds (or replaces) a named argument.
    pub fn arg(mut self, name: &str, value: ArgValue) -> Self {
        self.args.retain(|a| a.name != name);
        self.args.push(Argument {
            name: name.to_string(),
            value,
        });
        self
    }

    pub fn get_arg(&self, name: &str) -> Option<ArgValue> {
        self.args.iter().find(|a| a.name == name).map(|a| a.value)
    }

    /// Reads a float argument, accepting integer values and falling back
    /// to `default` when the argument is absent.
    pub fn get_arg_f32(&self, name: &str, default: f32) -> f32 {
        match self.get_arg(name) {
            Some(ArgValue::Float(v)) => v,
            Some(ArgValue::Int(v)) => v as f32,
            None => default,
        }
    }

    pub(crate) fn expect_arity(&self, inputs: usize, outputs: usize) -> Result<(), CheckError> {
        if self.inputs.len() != inputs || self.outputs.len() != outputs {
            return Err(CheckError::invalid_input(
                &self.op_type,
                format!(
                    "expected {} input(s) and {} output(s), descriptor has {} and {}",
                    inputs,
                    outputs,
                    self.inputs.len(),
                    self.outputs.len()
                ),
            ));
        }
        Ok(())
    }
}

/// Name of the gradient blob for `blob`.
pub fn grad_name(blob: &str) -> String {
    format!("{}_grad", blob)
}

/// A runnable operator. Runs on whatever device its inputs live on.
pub trait Operator {
    fn op_type(&self) -> &str;

    fn run(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, CheckError>;
}

/// Builds the operator named by `def.op_type`.
///
/// # Arguments
///
/// * `def` - The operator descriptor. Its arguments configure the operator.
///
/// # Returns
///
/// A `Result` containing the boxed operator, `CheckError::UnknownOperator`
/// for an unregistered type, or `CheckError::InvalidInput` when the
/// descriptor has the wrong number of inputs or outputs.
pub fn create_operator(def: &OperatorDef) -> Result<Box<dyn Operator>, CheckError> {
    match def.op_type.as_str() {
        COSINE_EMBEDDING_CRITERION => Ok(Box::new(CosineEmbeddingCriterion::from_def(def)?)),
        COSINE_EMBEDDING_CRITERION_GRADIENT => {
            Ok(Box::new(CosineEmbeddingCriterionGradient::from_def(def)?))
        }
        other => Err(CheckError::UnknownOperator(other.to_string())),
    }
}

/// Returns the operators that compute input gradients for `def`.
///
/// Gradient operators read the forward blobs plus `<output>_grad` and write
/// `<input>_grad`.
pub fn gradient_defs(def: &OperatorDef) -> Result<Vec<OperatorDef>, CheckError> {
    match def.op_type.as_str() {
        COSINE_EMBEDDING_CRITERION => {
            def.expect_arity(2, 1)?;
            let (scores, labels) = (&def.inputs[0], &def.inputs[1]);
            let output = &def.outputs[0];
            let mut grad = OperatorDef::new(
                COSINE_EMBEDDING_CRITERION_GRADIENT,
                [scores.clone(), labels.clone(), grad_name(output)],
                [grad_name(scores)],
            );
            grad.args = def.args.clone();
            Ok(vec![grad])
        }
        other => Err(CheckError::UnknownOperator(format!(
            "{} (no gradient registered)",
            other
        ))),
    }
}

/// Named tensors shared between operator runs.
#[derive(Default)]
pub struct Workspace {
    blobs: HashMap<String, Tensor>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_blob(&mut self, name: &str, tensor: Tensor) {
        self.blobs.insert(name.to_string(), tensor);
    }

    pub fn fetch_blob(&self, name: &str) -> Result<&Tensor, CheckError> {
        self.blobs
            .get(name)
            .ok_or_else(|| CheckError::MissingBlob(name.to_string()))
    }

    /// Runs `def`, reading its inputs from and writing its outputs to the
    /// workspace.
    pub fn run_operator(&mut self, def: &OperatorDef) -> Result<(), CheckError> {
        let op = create_operator(def)?;
        let inputs = def
            .inputs
            .iter()
            .map(|name| self.fetch_blob(name).map(Tensor::shallow_clone))
            .collect::<Result<Vec<_>, _>>()?;
        trace!("Running {} on {:?}", op.op_type(), def.inputs);
        let outputs = op.run(&inputs)?;
        if outputs.len() < def.outputs.len() {
            return Err(CheckError::MissingOutput {
                index: outputs.len(),
                produced: outputs.len(),
            });
        }
        for (name, tensor) in def.outputs.iter().zip(outputs) {
            self.feed_blob(name, tensor);
        }
        Ok(())
    }
}

// -------------------- Tests --------------------
