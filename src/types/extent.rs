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

use std::fmt;

use super::index_expr::{IndexExpr, SymEnv};
use super::{EvalError, Operand};

/// Size of one tensor axis: a literal known while lowering, or a deferred
/// expression over run-time operand dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AxisExtent {
    Literal(usize),
    Deferred(IndexExpr),
}

impl AxisExtent {
    /// Extent read from `operand`'s `axis` at run time.
    pub fn query(operand: Operand, axis: usize) -> Self {
        AxisExtent::Deferred(IndexExpr::dim(operand, axis))
    }

    /// Collapse an expression into a literal when it folded to a
    /// non-negative constant. Negative constants stay deferred so the caller
    /// can report them with context.
    pub fn from_expr(expr: IndexExpr) -> Self {
        match expr {
            IndexExpr::Const(v) if v >= 0 => AxisExtent::Literal(v as usize),
            other => AxisExtent::Deferred(other),
        }
    }

    pub fn to_expr(&self) -> IndexExpr {
        match self {
            AxisExtent::Literal(n) => IndexExpr::Const(*n as i64),
            AxisExtent::Deferred(expr) => expr.clone(),
        }
    }

    pub fn literal(&self) -> Option<usize> {
        match self {
            AxisExtent::Literal(n) => Some(*n),
            AxisExtent::Deferred(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, AxisExtent::Deferred(_))
    }

    pub fn eval<E: SymEnv + ?Sized>(&self, env: &E) -> Result<i64, EvalError> {
        match self {
            AxisExtent::Literal(n) => Ok(*n as i64),
            AxisExtent::Deferred(expr) => expr.eval(env),
        }
    }
}

impl fmt::Display for AxisExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisExtent::Literal(n) => write!(f, "{n}"),
            AxisExtent::Deferred(expr) => write!(f, "{{{expr}}}"),
        }
    }
}

/// Format a shape as `32x?x{...}` for messages and plan headers.
pub fn format_extents(extents: &[AxisExtent]) -> String {
    extents
        .iter()
        .map(|e| match e {
            AxisExtent::Literal(n) => n.to_string(),
            AxisExtent::Deferred(_) => "?".to_string(),
        })
        .collect::<Vec<_>>()
        .join("x")
}
