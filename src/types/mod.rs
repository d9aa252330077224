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

//! Basic tensor type definitions.
//!
//! # Example
//! ```
//! use mind_conv::types::{DType, ShapeDim, TensorType};
//! let ty = TensorType::new(DType::F32, vec![ShapeDim::Dynamic, ShapeDim::Known(3)]);
//! assert_eq!(ty.rank(), 2);
//! ```

pub mod extent;
pub mod index_expr;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use extent::AxisExtent;
pub use index_expr::{AffineForm, DimRef, EvalError, IndexExpr, IvEnv, LoopVar, Sym, SymEnv};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    F64,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

/// One axis of an operand shape descriptor as declared on the operator.
///
/// Serialized as an integer where `-1` marks an axis unknown until run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ShapeDim {
    Known(usize),
    Dynamic,
}

impl ShapeDim {
    pub fn known(&self) -> Option<usize> {
        match self {
            ShapeDim::Known(n) => Some(*n),
            ShapeDim::Dynamic => None,
        }
    }
}

impl TryFrom<i64> for ShapeDim {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(ShapeDim::Dynamic),
            n if n >= 0 => Ok(ShapeDim::Known(n as usize)),
            n => Err(format!("invalid extent {n}: expected a non-negative size or -1")),
        }
    }
}

impl From<ShapeDim> for i64 {
    fn from(dim: ShapeDim) -> i64 {
        match dim {
            ShapeDim::Known(n) => n as i64,
            ShapeDim::Dynamic => -1,
        }
    }
}

impl fmt::Display for ShapeDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeDim::Known(n) => write!(f, "{n}"),
            ShapeDim::Dynamic => f.write_str("?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorType {
    #[serde(default)]
    pub dtype: DType,
    pub shape: Vec<ShapeDim>,
}

impl TensorType {
    pub fn new(dtype: DType, shape: Vec<ShapeDim>) -> Self {
        Self { dtype, shape }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// Role of a buffer taking part in a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    Image,
    Filter,
    Bias,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operand::Image => "image",
            Operand::Filter => "filter",
            Operand::Bias => "bias",
        })
    }
}

/// Scalar element types the executor can run on.
pub trait Element:
    num_traits::Float + Send + Sync + fmt::Debug + Default + 'static
{
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
}
