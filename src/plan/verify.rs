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

use std::collections::BTreeSet;

use crate::plan::{BandKind, LoopNest};
use crate::types::{IndexExpr, LoopVar, Operand, Sym};

/// Structured errors returned by the loop-nest verifier.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanVerifyError {
    /// Bands are missing or out of order.
    #[error("expected bands [outer, spatial, reduction], found {0:?}")]
    BandLayout(Vec<BandKind>),
    /// A band has the wrong number of levels for the convolution rank.
    #[error("{kind} band has {found} levels, expected {expected}")]
    BandShape {
        kind: BandKind,
        expected: usize,
        found: usize,
    },
    /// Two levels drive the same induction variable.
    #[error("induction variable {0} is defined by more than one loop")]
    DuplicateVar(LoopVar),
    /// A bound references a variable that is not an enclosing loop.
    #[error("bound of loop `{level}` uses {var}, which is not an enclosing loop")]
    BoundUsesUndefinedVar { level: String, var: LoopVar },
    /// An access references a variable that is not in scope where it runs.
    #[error("{access} access uses {var}, which is not in scope")]
    AccessUsesUndefinedVar { access: &'static str, var: LoopVar },
    /// An access tuple does not match the operand rank.
    #[error("{access} access has {found} indices, operand rank is {expected}")]
    AccessRank {
        access: &'static str,
        expected: usize,
        found: usize,
    },
    /// A run-time dimension query names an axis the operand does not have.
    #[error("{context} queries {operand} axis {axis}, which does not exist")]
    DimOutOfRange {
        context: String,
        operand: Operand,
        axis: usize,
    },
}

/// Verify that a [`LoopNest`] is well-formed.
///
/// Checks band layout, unique induction variables, that every bound only
/// references enclosing loops, and that body accesses match operand ranks.
/// The accumulator store and bias read run after the reduction band, so
/// they may only use outer and spatial variables.
pub fn verify_loop_nest(nest: &LoopNest) -> Result<(), PlanVerifyError> {
    let desc = &nest.descriptor;
    let spatial = desc.spatial_rank();
    let ranks = Ranks {
        image: desc.image.len(),
        filter: desc.filter.len(),
        bias: desc.bias.as_ref().map(Vec::len),
    };

    let kinds: Vec<BandKind> = nest.bands.iter().map(|b| b.kind).collect();
    if kinds != [BandKind::Outer, BandKind::Spatial, BandKind::Reduction] {
        return Err(PlanVerifyError::BandLayout(kinds));
    }
    for band in &nest.bands {
        let expected = match band.kind {
            BandKind::Outer => 3,
            BandKind::Spatial => spatial,
            BandKind::Reduction => spatial + 1,
        };
        if band.levels.len() != expected {
            return Err(PlanVerifyError::BandShape {
                kind: band.kind,
                expected,
                found: band.levels.len(),
            });
        }
    }

    let mut defined: BTreeSet<LoopVar> = BTreeSet::new();
    let mut store_scope = BTreeSet::new();
    for band in &nest.bands {
        for level in &band.levels {
            for expr in [&level.bound.lower, &level.bound.upper] {
                check_expr(expr, &ranks, &level.name, &defined)
                    .map_err(|e| e.into_bound_error(&level.name))?;
            }
            if !defined.insert(level.var) {
                return Err(PlanVerifyError::DuplicateVar(level.var));
            }
        }
        if band.kind == BandKind::Spatial {
            store_scope = defined.clone();
        }
    }

    let body = &nest.body;
    check_access("image", &body.image, ranks.image, &ranks, &defined)?;
    check_access("filter", &body.filter, ranks.filter, &ranks, &defined)?;
    check_access("output", &body.output, ranks.image, &ranks, &store_scope)?;
    if let Some(bias) = &body.bias {
        check_access("bias", std::slice::from_ref(bias), ranks.bias.unwrap_or(0), &ranks, &store_scope)?;
    }
    Ok(())
}

struct Ranks {
    image: usize,
    filter: usize,
    bias: Option<usize>,
}

impl Ranks {
    fn of(&self, operand: Operand) -> usize {
        match operand {
            Operand::Image => self.image,
            Operand::Filter => self.filter,
            Operand::Bias => self.bias.unwrap_or(0),
        }
    }
}

enum ExprIssue {
    Undefined(LoopVar),
    Dim(PlanVerifyError),
}

impl ExprIssue {
    fn into_bound_error(self, level: &str) -> PlanVerifyError {
        match self {
            ExprIssue::Undefined(var) => PlanVerifyError::BoundUsesUndefinedVar {
                level: level.to_string(),
                var,
            },
            ExprIssue::Dim(err) => err,
        }
    }

    fn into_access_error(self, access: &'static str) -> PlanVerifyError {
        match self {
            ExprIssue::Undefined(var) => PlanVerifyError::AccessUsesUndefinedVar { access, var },
            ExprIssue::Dim(err) => err,
        }
    }
}

fn check_expr(
    expr: &IndexExpr,
    ranks: &Ranks,
    context: &str,
    scope: &BTreeSet<LoopVar>,
) -> Result<(), ExprIssue> {
    let mut issue = None;
    expr.for_each_sym(&mut |sym| {
        if issue.is_some() {
            return;
        }
        match sym {
            Sym::Iv(var) if !scope.contains(&var) => issue = Some(ExprIssue::Undefined(var)),
            Sym::Dim(dim) if dim.axis >= ranks.of(dim.operand) => {
                issue = Some(ExprIssue::Dim(PlanVerifyError::DimOutOfRange {
                    context: context.to_string(),
                    operand: dim.operand,
                    axis: dim.axis,
                }))
            }
            _ => {}
        }
    });
    issue.map_or(Ok(()), Err)
}

fn check_access(
    access: &'static str,
    indices: &[IndexExpr],
    rank: usize,
    ranks: &Ranks,
    scope: &BTreeSet<LoopVar>,
) -> Result<(), PlanVerifyError> {
    if indices.len() != rank {
        return Err(PlanVerifyError::AccessRank {
            access,
            expected: rank,
            found: indices.len(),
        });
    }
    for expr in indices {
        check_expr(expr, ranks, access, scope).map_err(|e| e.into_access_error(access))?;
    }
    Ok(())
}
