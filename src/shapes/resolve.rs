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

//! Dimension resolution: declared operand shapes to [`AxisExtent`]s, and
//! later, concrete buffer shapes to a symbol environment.

use crate::error::ConvError;
use crate::ops::conv::{ConvOp, OperandDecl};
use crate::types::{AxisExtent, Operand, ShapeDim, Sym, SymEnv};

use super::conv::ConvDescriptor;

/// Per-operand extents after resolution.
///
/// Filter and bias extents are always literal; image extents may be deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperandExtents {
    pub image: Vec<AxisExtent>,
    pub filter: Vec<AxisExtent>,
    pub bias: Option<Vec<AxisExtent>>,
}

impl OperandExtents {
    pub fn get(&self, operand: Operand, axis: usize) -> Option<&AxisExtent> {
        match operand {
            Operand::Image => self.image.get(axis),
            Operand::Filter => self.filter.get(axis),
            Operand::Bias => self.bias.as_ref().and_then(|b| b.get(axis)),
        }
    }
}

/// Map every declared axis of the operator's operands to an [`AxisExtent`].
///
/// Weights must be fully static: an unknown filter or bias axis is a
/// `MalformedOperand` error, as is a rank that does not fit the operand's
/// role (`[N, C, spatial..]`, `[M, C/group, kernel..]`, `[M]`).
pub fn resolve_operands(op: &ConvOp) -> Result<OperandExtents, ConvError> {
    let rank = op.image.shape.len();
    if rank < 3 {
        return Err(ConvError::malformed(
            Operand::Image,
            format!("expected rank >= 3 ([batch, channel, spatial..]), got rank {rank}"),
        ));
    }

    let image = op
        .image
        .shape
        .iter()
        .enumerate()
        .map(|(axis, dim)| match dim {
            ShapeDim::Known(n) => AxisExtent::Literal(*n),
            ShapeDim::Dynamic => AxisExtent::query(Operand::Image, axis),
        })
        .collect();

    if op.filter.shape.len() != rank {
        return Err(ConvError::malformed(
            Operand::Filter,
            format!(
                "expected rank {rank} to match the image, got rank {}",
                op.filter.shape.len()
            ),
        ));
    }
    let filter = static_extents(Operand::Filter, &op.filter)?;

    let bias = match &op.bias {
        None => None,
        Some(decl) => {
            if decl.shape.len() != 1 {
                return Err(ConvError::malformed(
                    Operand::Bias,
                    format!("expected rank 1, got rank {}", decl.shape.len()),
                ));
            }
            Some(static_extents(Operand::Bias, decl)?)
        }
    };

    Ok(OperandExtents {
        image,
        filter,
        bias,
    })
}

fn static_extents(operand: Operand, decl: &OperandDecl) -> Result<Vec<AxisExtent>, ConvError> {
    decl.shape
        .iter()
        .enumerate()
        .map(|(axis, dim)| match dim {
            ShapeDim::Known(n) => Ok(AxisExtent::Literal(*n)),
            ShapeDim::Dynamic => Err(ConvError::malformed(
                operand,
                format!("axis {axis} must be statically known"),
            )),
        })
        .collect()
}

/// Concrete operand shapes observed at run time, usable as a [`SymEnv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDims {
    pub image: Vec<usize>,
    pub filter: Vec<usize>,
    pub bias: Option<Vec<usize>>,
}

impl SymEnv for ResolvedDims {
    fn lookup(&self, sym: Sym) -> Option<i64> {
        let Sym::Dim(dim) = sym else {
            return None;
        };
        let shape = match dim.operand {
            Operand::Image => &self.image,
            Operand::Filter => &self.filter,
            Operand::Bias => self.bias.as_ref()?,
        };
        shape.get(dim.axis).map(|&n| n as i64)
    }
}

/// Check concrete buffer shapes against a descriptor.
///
/// Literal extents must match exactly; deferred image extents are accepted
/// as observed, subject to the grouped-channel consistency check that could
/// not run at construction time.
pub fn bind_operand_shapes(
    desc: &ConvDescriptor,
    image: &[usize],
    filter: &[usize],
    bias: Option<&[usize]>,
) -> Result<ResolvedDims, ConvError> {
    check_rank(Operand::Image, &desc.image, image)?;
    check_literals(Operand::Image, &desc.image, image)?;
    check_rank(Operand::Filter, &desc.filter, filter)?;
    check_literals(Operand::Filter, &desc.filter, filter)?;

    match (&desc.bias, bias) {
        (Some(expected), Some(found)) => {
            check_rank(Operand::Bias, expected, found)?;
            check_literals(Operand::Bias, expected, found)?;
        }
        (None, None) => {}
        (Some(_), None) => {
            return Err(ConvError::malformed(
                Operand::Bias,
                "plan was built with a bias operand but none was supplied",
            ))
        }
        (None, Some(_)) => {
            return Err(ConvError::malformed(
                Operand::Bias,
                "plan was built without a bias operand",
            ))
        }
    }

    let channels = image[1];
    if channels % desc.group != 0 {
        return Err(ConvError::invalid_shape(format!(
            "image channels {channels} are not divisible by group {}",
            desc.group
        )));
    }
    let expected = desc.group * desc.in_channels_per_group();
    if channels != expected {
        return Err(ConvError::ShapeMismatch {
            operand: Operand::Image,
            axis: 1,
            expected,
            found: channels,
        });
    }

    Ok(ResolvedDims {
        image: image.to_vec(),
        filter: filter.to_vec(),
        bias: bias.map(<[usize]>::to_vec),
    })
}

fn check_rank(operand: Operand, expected: &[AxisExtent], found: &[usize]) -> Result<(), ConvError> {
    if expected.len() != found.len() {
        return Err(ConvError::malformed(
            operand,
            format!("expected rank {}, buffer has rank {}", expected.len(), found.len()),
        ));
    }
    Ok(())
}

fn check_literals(operand: Operand, expected: &[AxisExtent], found: &[usize]) -> Result<(), ConvError> {
    for (axis, (extent, &actual)) in expected.iter().zip(found).enumerate() {
        if let AxisExtent::Literal(n) = extent {
            if *n != actual {
                return Err(ConvError::ShapeMismatch {
                    operand,
                    axis,
                    expected: *n,
                    found: actual,
                });
            }
        }
    }
    Ok(())
}
