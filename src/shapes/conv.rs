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

//! Convolution shape algebra.
//!
//! Builds a [`ConvDescriptor`] from an operator description: per-axis
//! padding under the selected mode and the output extents
//! `floor((I + pb + pe - K) / S) + 1`. Literal inputs fold to literal
//! results; deferred image axes yield deferred formulas of the same shape.

use tracing::debug;

use crate::error::ConvError;
use crate::ops::conv::{ConvOp, PaddingMode};
use crate::types::extent::format_extents;
use crate::types::{AxisExtent, DType, IndexExpr, Operand, SymEnv};

use super::resolve::resolve_operands;

/// Begin and end padding of one spatial axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PadPair {
    pub begin: AxisExtent,
    pub end: AxisExtent,
}

impl PadPair {
    pub fn literal(begin: usize, end: usize) -> Self {
        Self {
            begin: AxisExtent::Literal(begin),
            end: AxisExtent::Literal(end),
        }
    }
}

/// Per-spatial-axis padding, derived once from the padding mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingSpec {
    pub mode: PaddingMode,
    pub axes: Vec<PadPair>,
}

impl PaddingSpec {
    /// Literal `(begin, end)` pairs, if no axis needs the run-time image.
    pub fn literal_pairs(&self) -> Option<Vec<(usize, usize)>> {
        self.axes
            .iter()
            .map(|p| Some((p.begin.literal()?, p.end.literal()?)))
            .collect()
    }
}

/// Fully resolved convolution problem instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvDescriptor {
    pub name: String,
    pub dtype: DType,
    /// `[N, C, spatial..]`
    pub image: Vec<AxisExtent>,
    /// `[M, C / group, kernel..]`, all literal.
    pub filter: Vec<AxisExtent>,
    /// `[M]`, all literal.
    pub bias: Option<Vec<AxisExtent>>,
    pub group: usize,
    pub strides: Vec<usize>,
    pub padding: PaddingSpec,
    /// `[N, M, out..]`
    pub output: Vec<AxisExtent>,
}

impl ConvDescriptor {
    pub fn spatial_rank(&self) -> usize {
        self.image.len() - 2
    }

    fn filter_dim(&self, axis: usize) -> usize {
        self.filter[axis].literal().unwrap_or(0)
    }

    pub fn out_channels(&self) -> usize {
        self.filter_dim(0)
    }

    pub fn in_channels_per_group(&self) -> usize {
        self.filter_dim(1)
    }

    pub fn out_channels_per_group(&self) -> usize {
        self.out_channels() / self.group
    }

    /// Kernel extent of spatial axis `i`.
    pub fn kernel(&self, i: usize) -> usize {
        self.filter_dim(i + 2)
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn is_fully_literal(&self) -> bool {
        self.output.iter().all(|e| !e.is_deferred())
    }

    /// Evaluate the output extents against concrete operand shapes.
    ///
    /// A non-positive spatial extent is `InvalidShape`; batch may be zero.
    pub fn resolve_output_shape<E: SymEnv + ?Sized>(&self, env: &E) -> Result<Vec<usize>, ConvError> {
        let mut shape = Vec::with_capacity(self.output.len());
        for (axis, extent) in self.output.iter().enumerate() {
            let value = extent.eval(env)?;
            if axis >= 2 && value <= 0 {
                return Err(ConvError::invalid_shape(format!(
                    "`{}`: output spatial axis {} resolves to {value}",
                    self.name,
                    axis - 2
                )));
            }
            if value < 0 {
                return Err(ConvError::invalid_shape(format!(
                    "`{}`: output axis {axis} resolves to {value}",
                    self.name
                )));
            }
            shape.push(value as usize);
        }
        Ok(shape)
    }
}

/// Derive the full descriptor for `op`.
///
/// Every check whose operands are literal fires here; checks on deferred
/// image axes are left to plan binding.
pub fn build_descriptor(op: &ConvOp) -> Result<ConvDescriptor, ConvError> {
    let extents = resolve_operands(op)?;
    let spatial = extents.image.len() - 2;
    let filter_dims: Vec<usize> = extents.filter.iter().filter_map(AxisExtent::literal).collect();

    if op.group == 0 {
        return Err(ConvError::unsupported("group must be at least 1"));
    }
    let group = op.group;
    let out_channels = filter_dims[0];
    let cin_per_group = filter_dims[1];
    if out_channels == 0 || cin_per_group == 0 {
        return Err(ConvError::invalid_shape(format!(
            "filter channel extents must be positive, got [{out_channels}, {cin_per_group}, ..]"
        )));
    }
    if out_channels % group != 0 {
        return Err(ConvError::invalid_shape(format!(
            "filter output channels {out_channels} are not divisible by group {group}"
        )));
    }
    let kernel = &filter_dims[2..];
    if let Some(axis) = kernel.iter().position(|&k| k == 0) {
        return Err(ConvError::invalid_shape(format!("kernel extent of spatial axis {axis} is zero")));
    }

    if let Some(AxisExtent::Literal(channels)) = extents.image.get(1) {
        let channels = *channels;
        if channels % group != 0 {
            return Err(ConvError::invalid_shape(format!(
                "image channels {channels} are not divisible by group {group}"
            )));
        }
        if channels / group != cin_per_group {
            return Err(ConvError::ShapeMismatch {
                operand: Operand::Image,
                axis: 1,
                expected: group * cin_per_group,
                found: channels,
            });
        }
    }

    if let Some(bias) = &extents.bias {
        let len = bias[0].literal().unwrap_or(0);
        if len != out_channels {
            return Err(ConvError::ShapeMismatch {
                operand: Operand::Bias,
                axis: 0,
                expected: out_channels,
                found: len,
            });
        }
    }

    let strides = if op.strides.is_empty() {
        vec![1; spatial]
    } else {
        op.strides.clone()
    };
    if strides.len() != spatial {
        return Err(ConvError::unsupported(format!(
            "strides has {} entries, expected {spatial}",
            strides.len()
        )));
    }
    if strides.contains(&0) {
        return Err(ConvError::unsupported("strides must be at least 1"));
    }

    if let Some(dilations) = &op.dilations {
        if dilations.len() != spatial {
            return Err(ConvError::unsupported(format!(
                "dilations has {} entries, expected {spatial}",
                dilations.len()
            )));
        }
        if dilations.iter().any(|&d| d != 1) {
            return Err(ConvError::unsupported(format!(
                "dilations {dilations:?} are not supported, only 1"
            )));
        }
    }

    if let Some(declared) = &op.kernel_shape {
        if declared.len() != spatial {
            return Err(ConvError::unsupported(format!(
                "kernel_shape has {} entries, expected {spatial}",
                declared.len()
            )));
        }
        if declared.as_slice() != kernel {
            return Err(ConvError::invalid_shape(format!(
                "kernel_shape {declared:?} disagrees with filter spatial extents {kernel:?}"
            )));
        }
    }

    let mode = op.padding_mode()?;
    if let PaddingMode::Explicit(values) = &mode {
        for &pad in values {
            index_value("pad", pad)?;
        }
    }
    let mut pads = Vec::with_capacity(spatial);
    let mut output = Vec::with_capacity(spatial + 2);
    output.push(extents.image[0].clone());
    output.push(AxisExtent::Literal(out_channels));

    for i in 0..spatial {
        if let Some(extent) = extents.image[i + 2].literal() {
            index_value("image extent", extent)?;
        }
        let input = extents.image[i + 2].to_expr();
        let k = index_value("kernel extent", kernel[i])?;
        let s = index_value("stride", strides[i])?;
        let pair = derive_pads(&mode, i, spatial, &input, k, s);

        let effective = input + pair.begin.to_expr() + pair.end.to_expr();
        let out = IndexExpr::floor_div(effective - k, s) + 1;
        let mut symbolic = false;
        out.for_each_sym(&mut |_| symbolic = true);
        if !symbolic && !out.is_const() {
            return Err(ConvError::invalid_shape(format!(
                "`{}`: output extent of spatial axis {i} overflows (input {}, kernel {k}, stride {s}, pads ({}, {}))",
                op.name, extents.image[i + 2], pair.begin, pair.end
            )));
        }
        if let Some(value) = out.as_const() {
            if value <= 0 {
                return Err(ConvError::invalid_shape(format!(
                    "`{}`: spatial axis {i} has input {}, kernel {k}, stride {s}, pads ({}, {}) \
                     giving output extent {value}",
                    op.name, extents.image[i + 2], pair.begin, pair.end
                )));
            }
        }
        output.push(AxisExtent::from_expr(out));
        pads.push(pair);
    }

    let padding = PaddingSpec { mode, axes: pads };
    debug!(
        op = %op.name,
        mode = padding.mode.name(),
        group,
        image = %format_extents(&extents.image),
        output = %format_extents(&output),
        "derived convolution shape"
    );

    Ok(ConvDescriptor {
        name: op.name.clone(),
        dtype: op.dtype,
        image: extents.image,
        filter: extents.filter,
        bias: extents.bias,
        group,
        strides,
        padding,
        output,
    })
}

fn index_value(what: &str, value: usize) -> Result<i64, ConvError> {
    i64::try_from(value).map_err(|_| ConvError::invalid_shape(format!("{what} {value} is out of index range")))
}

fn derive_pads(mode: &PaddingMode, axis: usize, spatial: usize, input: &IndexExpr, k: i64, s: i64) -> PadPair {
    match mode {
        PaddingMode::Explicit(pads) => PadPair::literal(pads[axis], pads[axis + spatial]),
        PaddingMode::Valid => PadPair::literal(0, 0),
        PaddingMode::SameUpper | PaddingMode::SameLower | PaddingMode::SameSymmetric => {
            let out = IndexExpr::ceil_div(input.clone(), s);
            let total = IndexExpr::max(IndexExpr::Const(0), (out - 1) * s + k - input.clone());
            let small = IndexExpr::floor_div(total.clone(), 2);
            let large = total - small.clone();
            let (begin, end) = match mode {
                PaddingMode::SameUpper => (small, large),
                PaddingMode::SameLower => (large, small),
                _ => (small.clone(), small),
            };
            PadPair {
                begin: AxisExtent::from_expr(begin),
                end: AxisExtent::from_expr(end),
            }
        }
    }
}
