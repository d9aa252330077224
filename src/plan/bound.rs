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

//! Loop bound synthesis.
//!
//! Every loop level iterates over a half-open range `[lower, upper)` whose
//! ends are [`IndexExpr`]s over outer induction variables and operand
//! dimensions. Kernel-window levels are clipped to the in-bounds part of the
//! image so padding is never materialized:
//!
//! ```text
//! lower_k(o) = max(0, pb - o * S)
//! upper_k(o) = min(K, I - o * S + pb)
//! ```

use std::fmt;

use crate::shapes::ConvDescriptor;
use crate::types::{EvalError, IndexExpr, LoopVar, SymEnv};

/// Half-open iteration range of one loop level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBound {
    pub lower: IndexExpr,
    pub upper: IndexExpr,
}

impl LoopBound {
    pub fn new(lower: IndexExpr, upper: IndexExpr) -> Self {
        Self { lower, upper }
    }

    /// `[0, upper)`
    pub fn upto(upper: IndexExpr) -> Self {
        Self::new(IndexExpr::Const(0), upper)
    }

    pub fn eval<E: SymEnv + ?Sized>(&self, env: &E) -> Result<(i64, i64), EvalError> {
        Ok((self.lower.eval(env)?, self.upper.eval(env)?))
    }

    pub fn substitute_dims<E: SymEnv + ?Sized>(&self, env: &E) -> LoopBound {
        LoopBound::new(self.lower.substitute_dims(env), self.upper.substitute_dims(env))
    }

    /// Trip count when both ends are constant.
    pub fn const_trip_count(&self) -> Option<i64> {
        Some((self.upper.as_const()? - self.lower.as_const()?).max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopLevel {
    pub var: LoopVar,
    pub name: String,
    pub bound: LoopBound,
}

impl LoopLevel {
    pub fn new(var: LoopVar, name: impl Into<String>, bound: LoopBound) -> Self {
        Self {
            var,
            name: name.into(),
            bound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BandKind {
    /// Batch, group, and within-group output channel.
    Outer,
    /// Output spatial coordinates.
    Spatial,
    /// Within-group input channel, then kernel spatial offsets.
    Reduction,
}

impl fmt::Display for BandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BandKind::Outer => "outer",
            BandKind::Spatial => "spatial",
            BandKind::Reduction => "reduction",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Band {
    pub kind: BandKind,
    pub levels: Vec<LoopLevel>,
}

/// Induction variable slot assignment for a convolution with `spatial`
/// spatial axes: `n, g, ocg, o0.., icg, k0..`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopVars {
    pub spatial: usize,
}

impl LoopVars {
    pub fn new(spatial: usize) -> Self {
        Self { spatial }
    }

    pub fn batch(&self) -> LoopVar {
        LoopVar(0)
    }

    pub fn group(&self) -> LoopVar {
        LoopVar(1)
    }

    pub fn out_channel(&self) -> LoopVar {
        LoopVar(2)
    }

    pub fn out(&self, axis: usize) -> LoopVar {
        LoopVar(3 + axis)
    }

    pub fn in_channel(&self) -> LoopVar {
        LoopVar(3 + self.spatial)
    }

    pub fn kernel(&self, axis: usize) -> LoopVar {
        LoopVar(4 + self.spatial + axis)
    }

    /// Number of slots an induction variable vector needs.
    pub fn count(&self) -> usize {
        4 + 2 * self.spatial
    }
}

fn lit(n: usize) -> IndexExpr {
    IndexExpr::Const(n as i64)
}

pub fn outer_band(desc: &ConvDescriptor, vars: LoopVars) -> Band {
    Band {
        kind: BandKind::Outer,
        levels: vec![
            LoopLevel::new(vars.batch(), "n", LoopBound::upto(desc.output[0].to_expr())),
            LoopLevel::new(vars.group(), "g", LoopBound::upto(lit(desc.group))),
            LoopLevel::new(
                vars.out_channel(),
                "ocg",
                LoopBound::upto(lit(desc.out_channels_per_group())),
            ),
        ],
    }
}

pub fn spatial_band(desc: &ConvDescriptor, vars: LoopVars) -> Band {
    let levels = (0..desc.spatial_rank())
        .map(|i| {
            LoopLevel::new(
                vars.out(i),
                format!("o{i}"),
                LoopBound::upto(desc.output[i + 2].to_expr()),
            )
        })
        .collect();
    Band {
        kind: BandKind::Spatial,
        levels,
    }
}

pub fn reduction_band(desc: &ConvDescriptor, vars: LoopVars) -> Band {
    let mut levels = Vec::with_capacity(desc.spatial_rank() + 1);
    levels.push(LoopLevel::new(
        vars.in_channel(),
        "icg",
        LoopBound::upto(lit(desc.in_channels_per_group())),
    ));
    for i in 0..desc.spatial_rank() {
        levels.push(LoopLevel::new(vars.kernel(i), format!("k{i}"), kernel_window(desc, vars, i)));
    }
    Band {
        kind: BandKind::Reduction,
        levels,
    }
}

/// Clipped kernel range of spatial axis `axis` at the current output
/// coordinate.
pub fn kernel_window(desc: &ConvDescriptor, vars: LoopVars, axis: usize) -> LoopBound {
    let k = lit(desc.kernel(axis));
    let stride = desc.strides[axis] as i64;
    let begin = desc.padding.axes[axis].begin.to_expr();
    let input = desc.image[axis + 2].to_expr();
    let origin = IndexExpr::iv(vars.out(axis)) * stride;

    // o * S >= 0, so without a begin pad the window never starts early.
    let lower = if begin == IndexExpr::Const(0) {
        IndexExpr::Const(0)
    } else {
        IndexExpr::max(IndexExpr::Const(0), begin.clone() - origin.clone())
    };
    let upper = IndexExpr::min(k, input - origin + begin);
    LoopBound::new(lower, upper)
}

/// Image coordinate read at kernel offset `k` of output position `o`:
/// `o * S + k - pb`.
pub fn image_read_index(desc: &ConvDescriptor, vars: LoopVars, axis: usize) -> IndexExpr {
    let stride = desc.strides[axis] as i64;
    let begin = desc.padding.axes[axis].begin.to_expr();
    IndexExpr::iv(vars.out(axis)) * stride + IndexExpr::iv(vars.kernel(axis)) - begin
}

/// Absolute channel `group * per_group + within`.
pub fn grouped_channel(group: LoopVar, per_group: usize, within: LoopVar) -> IndexExpr {
    IndexExpr::iv(group) * per_group as i64 + IndexExpr::iv(within)
}
