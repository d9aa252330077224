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

//! Nested-loop plans for convolution.
//!
//! A [`LoopNest`] is the symbolic plan produced at lowering time: its bounds
//! and accesses may still reference run-time operand dimensions. Binding it
//! to concrete operand shapes yields an [`ExecutionPlan`] with every
//! dimension resolved, consumed once by the executor.
//!
//! Traversal order, outer to inner:
//!
//! ```text
//! n, g, ocg            outer band
//! o0 .. o{S-1}         spatial band
//!   acc = 0
//!   icg, k0 .. k{S-1}  reduction band
//!     acc += image[n, g*CIG + icg, o*S + k - pb ..] * filter[g*COG + ocg, icg, k ..]
//!   acc += bias[g*COG + ocg]          (only with a bias operand)
//!   output[n, g*COG + ocg, o ..] = acc
//! ```

pub mod bound;
pub mod print;
pub mod verify;

use std::fmt;

use tracing::debug;

use crate::error::ConvError;
use crate::instrument::MarkTag;
use crate::runtime::TensorDesc;
use crate::shapes::{bind_operand_shapes, ConvDescriptor};
use crate::types::{DType, IndexExpr, LoopVar, SymEnv};

pub use bound::{Band, BandKind, LoopBound, LoopLevel, LoopVars};
pub use print::format_loop_nest;
pub use verify::{verify_loop_nest, PlanVerifyError};

/// Per-element computation of the innermost spatial level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBody {
    /// Image coordinate read by the multiply-accumulate.
    pub image: Vec<IndexExpr>,
    /// Filter coordinate read by the multiply-accumulate.
    pub filter: Vec<IndexExpr>,
    /// Bias element added after the reduction, if there is a bias operand.
    pub bias: Option<IndexExpr>,
    /// Output coordinate stored to.
    pub output: Vec<IndexExpr>,
}

impl LoopBody {
    fn substitute_dims<E: SymEnv + ?Sized>(&self, env: &E) -> LoopBody {
        let sub = |v: &[IndexExpr]| -> Vec<IndexExpr> { v.iter().map(|e| e.substitute_dims(env)).collect() };
        LoopBody {
            image: sub(&self.image),
            filter: sub(&self.filter),
            bias: self.bias.as_ref().map(|e| e.substitute_dims(env)),
            output: sub(&self.output),
        }
    }
}

/// Instrumentation points around plan execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanMarks {
    pub op_name: String,
    pub node_name: String,
    pub before: Option<MarkTag>,
    pub after: Option<MarkTag>,
}

impl PlanMarks {
    /// Marks carrying `flags` (time and memory bits) at the requested points.
    pub fn new(op_name: &str, node_name: &str, before: bool, after: bool, flags: u64) -> Self {
        let tag = |phase: u64| MarkTag::new(phase | flags, op_name, node_name);
        Self {
            op_name: op_name.to_string(),
            node_name: node_name.to_string(),
            before: before.then(|| tag(MarkTag::BEFORE_OP)),
            after: after.then(|| tag(MarkTag::AFTER_OP)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNest {
    pub descriptor: ConvDescriptor,
    pub vars: LoopVars,
    /// Outer, spatial, reduction.
    pub bands: Vec<Band>,
    pub body: LoopBody,
    pub marks: Option<PlanMarks>,
    /// Distribute output planes across worker threads.
    pub parallel: bool,
}

impl LoopNest {
    /// Compose the three bands and the body for `descriptor`.
    pub fn assemble(descriptor: ConvDescriptor) -> Self {
        let vars = LoopVars::new(descriptor.spatial_rank());
        let bands = vec![
            bound::outer_band(&descriptor, vars),
            bound::spatial_band(&descriptor, vars),
            bound::reduction_band(&descriptor, vars),
        ];
        let body = assemble_body(&descriptor, vars);
        debug!(
            op = %descriptor.name,
            levels = bands.iter().map(|b| b.levels.len()).sum::<usize>(),
            bias = descriptor.has_bias(),
            "assembled loop nest"
        );
        Self {
            descriptor,
            vars,
            bands,
            body,
            marks: None,
            parallel: false,
        }
    }

    pub fn with_marks(mut self, marks: PlanMarks) -> Self {
        self.marks = Some(marks);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn band(&self, kind: BandKind) -> Option<&Band> {
        self.bands.iter().find(|b| b.kind == kind)
    }

    /// All loop levels, outermost first.
    pub fn levels(&self) -> impl Iterator<Item = &LoopLevel> {
        self.bands.iter().flat_map(|b| b.levels.iter())
    }

    /// Name of the level driving `var`, if any.
    pub fn var_name(&self, var: LoopVar) -> Option<&str> {
        self.levels().find(|l| l.var == var).map(|l| l.name.as_str())
    }

    /// Resolve every deferred extent against concrete operand shapes.
    ///
    /// All shape checks happen here, before the executor allocates anything.
    pub fn bind(
        &self,
        image: &[usize],
        filter: &[usize],
        bias: Option<&[usize]>,
    ) -> Result<ExecutionPlan, ConvError> {
        let desc = &self.descriptor;
        let dims = bind_operand_shapes(desc, image, filter, bias)?;
        let output_shape = desc.resolve_output_shape(&dims)?;

        let bands = self
            .bands
            .iter()
            .map(|band| Band {
                kind: band.kind,
                levels: band
                    .levels
                    .iter()
                    .map(|l| LoopLevel::new(l.var, l.name.clone(), l.bound.substitute_dims(&dims)))
                    .collect(),
            })
            .collect();
        let body = self.body.substitute_dims(&dims);

        debug!(op = %desc.name, image = ?image, output = ?output_shape, "bound loop nest");
        Ok(ExecutionPlan {
            name: desc.name.clone(),
            dtype: desc.dtype,
            image_shape: dims.image,
            filter_shape: dims.filter,
            bias_shape: dims.bias,
            output_shape,
            vars: self.vars,
            bands,
            body,
            marks: self.marks.clone(),
            parallel: self.parallel,
        })
    }
}

fn assemble_body(desc: &ConvDescriptor, vars: LoopVars) -> LoopBody {
    let spatial = desc.spatial_rank();
    let out_channel = bound::grouped_channel(vars.group(), desc.out_channels_per_group(), vars.out_channel());
    let in_channel = bound::grouped_channel(vars.group(), desc.in_channels_per_group(), vars.in_channel());

    let mut image = vec![IndexExpr::iv(vars.batch()), in_channel];
    let mut filter = vec![out_channel.clone(), IndexExpr::iv(vars.in_channel())];
    let mut output = vec![IndexExpr::iv(vars.batch()), out_channel.clone()];
    for i in 0..spatial {
        image.push(bound::image_read_index(desc, vars, i));
        filter.push(IndexExpr::iv(vars.kernel(i)));
        output.push(IndexExpr::iv(vars.out(i)));
    }

    LoopBody {
        image,
        filter,
        bias: desc.has_bias().then_some(out_channel),
        output,
    }
}

impl fmt::Display for LoopNest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_loop_nest(self))
    }
}

/// A loop nest with every operand dimension resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub name: String,
    pub dtype: DType,
    pub image_shape: Vec<usize>,
    pub filter_shape: Vec<usize>,
    pub bias_shape: Option<Vec<usize>>,
    pub output_shape: Vec<usize>,
    pub vars: LoopVars,
    pub bands: Vec<Band>,
    pub body: LoopBody,
    pub marks: Option<PlanMarks>,
    pub parallel: bool,
}

impl ExecutionPlan {
    pub fn output_desc(&self) -> TensorDesc {
        TensorDesc::new(self.output_shape.clone(), self.dtype)
    }

    pub fn band(&self, kind: BandKind) -> Option<&Band> {
        self.bands.iter().find(|b| b.kind == kind)
    }

    pub fn levels(&self) -> impl Iterator<Item = &LoopLevel> {
        self.bands.iter().flat_map(|b| b.levels.iter())
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&print::format_execution_plan(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::conv::{ConvOp, OperandDecl};
    use crate::shapes::build_descriptor;
    use crate::types::{Operand, ShapeDim};

    fn nest(op: &ConvOp) -> LoopNest {
        LoopNest::assemble(build_descriptor(op).expect("descriptor"))
    }

    #[test]
    fn bands_follow_fixed_order() {
        let n = nest(&ConvOp::new(OperandDecl::known(&[1, 9, 32, 64]), OperandDecl::known(&[6, 3, 6, 7])).with_group(3));
        let names: Vec<_> = n.levels().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["n", "g", "ocg", "o0", "o1", "icg", "k0", "k1"]);
        assert_eq!(n.band(BandKind::Outer).map(|b| b.levels.len()), Some(3));
        assert_eq!(n.var_name(n.vars.in_channel()), Some("icg"));
        assert_eq!(n.body.filter[0].to_string(), "iv1 * 2 + iv2");
        assert_eq!(n.body.image[1].to_string(), "iv1 * 3 + iv5");
        assert!(n.body.bias.is_none());
    }

    #[test]
    fn binding_resolves_deferred_extents() {
        let image = OperandDecl::new(vec![ShapeDim::Dynamic, ShapeDim::Known(1), ShapeDim::Dynamic, ShapeDim::Dynamic]);
        let n = nest(&ConvOp::new(image, OperandDecl::known(&[2, 1, 3, 3])).with_auto_pad("SAME_UPPER"));
        assert!(n.levels().any(|l| l.bound.upper.mentions_dims()));

        let plan = n.bind(&[2, 1, 8, 5], &[2, 1, 3, 3], None).expect("bind");
        assert_eq!(plan.output_shape, vec![2, 2, 8, 5]);
        assert!(plan.levels().all(|l| !l.bound.lower.mentions_dims() && !l.bound.upper.mentions_dims()));
        assert!(plan.body.image.iter().all(|e| !e.mentions_dims()));
        assert_eq!(plan.output_desc().num_elements(), 2 * 2 * 8 * 5);
    }

    #[test]
    fn binding_rejects_inconsistent_buffers() {
        let image = OperandDecl::new(vec![ShapeDim::Dynamic, ShapeDim::Dynamic, ShapeDim::Known(8)]);
        let n = nest(&ConvOp::new(image, OperandDecl::known(&[4, 2, 3])).with_group(2));
        assert_eq!(
            n.bind(&[1, 6, 8], &[4, 2, 3], None),
            Err(ConvError::ShapeMismatch {
                operand: Operand::Image,
                axis: 1,
                expected: 4,
                found: 6
            })
        );
        assert!(matches!(
            n.bind(&[1, 4, 9], &[4, 2, 3], None),
            Err(ConvError::ShapeMismatch {
                operand: Operand::Image,
                axis: 2,
                ..
            })
        ));
        assert!(n.bind(&[1, 4, 8], &[4, 2, 3], None).is_ok());
    }

    #[test]
    fn deferred_window_too_small_fails_at_bind() {
        let image = OperandDecl::new(vec![ShapeDim::Known(1), ShapeDim::Known(1), ShapeDim::Dynamic]);
        let n = nest(&ConvOp::new(image, OperandDecl::known(&[1, 1, 5])).with_auto_pad("VALID"));
        assert!(matches!(n.bind(&[1, 1, 3], &[1, 1, 5], None), Err(ConvError::InvalidShape(_))));
        assert!(n.bind(&[1, 1, 5], &[1, 1, 5], None).is_ok());
    }

    #[test]
    fn marks_carry_flags() {
        let marks = PlanMarks::new("conv", "stem", true, false, MarkTag::REPORT_TIME);
        let before = marks.before.expect("before mark");
        assert!(before.is_before() && before.reports_time());
        assert!(marks.after.is_none());
    }
}
