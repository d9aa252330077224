// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

use crate::runtime::RuntimeError;
use crate::types::{EvalError, Operand};

/// Structured failures of convolution lowering and execution.
///
/// All variants are fatal. Construction-time checks fire while lowering when
/// the offending extents are literal; the same checks fire while binding a
/// plan to buffers when the extents were deferred. Binding completes before
/// the output is allocated, so an error never leaves a partial result.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConvError {
    /// A weight or bias axis is not statically known, or an operand has the
    /// wrong rank for its role.
    #[error("malformed {operand} operand: {message}")]
    MalformedOperand { operand: Operand, message: String },
    /// Unrecognized padding mode or an attribute combination the lowering
    /// does not handle.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    /// Non-positive derived output extent or channel count not divisible by
    /// the group count.
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    /// A run-time extent disagrees with what the plan was built for.
    #[error("shape mismatch on {operand} axis {axis}: expected {expected}, found {found}")]
    ShapeMismatch {
        operand: Operand,
        axis: usize,
        expected: usize,
        found: usize,
    },
    /// Symbolic extent could not be evaluated.
    #[error("failed to evaluate extent: {0}")]
    Eval(#[from] EvalError),
    /// The buffer runtime refused the output allocation.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl ConvError {
    pub(crate) fn malformed(operand: Operand, message: impl Into<String>) -> Self {
        ConvError::MalformedOperand {
            operand,
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        ConvError::UnsupportedConfiguration(message.into())
    }

    pub(crate) fn invalid_shape(message: impl Into<String>) -> Self {
        ConvError::InvalidShape(message.into())
    }
}
