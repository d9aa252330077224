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

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::plan::{verify_loop_nest, BandKind, LoopNest, PlanVerifyError};
use crate::types::{AxisExtent, DType, DimRef, IndexExpr, LoopVar, Operand, Sym};

/// Structured errors produced by the MLIR lowering pipeline.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MlirLowerError {
    /// An index expression references a loop variable with no enclosing loop.
    #[error("no loop defines {0}")]
    UnboundLoopVar(LoopVar),
    /// Loop-nest verification failed before lowering.
    #[error("loop nest verification failed: {0}")]
    VerificationFailed(#[from] PlanVerifyError),
}

/// A lowered MLIR module in textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlirModule {
    /// The fully formatted MLIR module text.
    pub text: String,
}

struct LoweringContext<'a> {
    nest: &'a LoopNest,
    loop_names: BTreeMap<LoopVar, String>,
    consts: BTreeSet<i64>,
    dims: BTreeSet<DimRef>,
    body: String,
    indent: usize,
    next_tmp: usize,
}

impl<'a> LoweringContext<'a> {
    fn new(nest: &'a LoopNest) -> Self {
        let loop_names = nest.levels().map(|l| (l.var, format!("%{}", l.name))).collect();
        Self {
            nest,
            loop_names,
            consts: BTreeSet::new(),
            dims: BTreeSet::new(),
            body: String::new(),
            indent: 2,
            next_tmp: 0,
        }
    }

    fn emit_line(&mut self, line: &str) {
        let _ = writeln!(&mut self.body, "{}{line}", "  ".repeat(self.indent));
    }

    fn fresh(&mut self) -> String {
        let name = format!("%t{}", self.next_tmp);
        self.next_tmp += 1;
        name
    }

    fn constant(&mut self, value: i64) -> String {
        self.consts.insert(value);
        const_name(value)
    }

    fn dim(&mut self, dim: DimRef) -> String {
        self.consts.insert(dim.axis as i64);
        self.dims.insert(dim);
        dim_name(dim)
    }

    fn binary(&mut self, op: &str, lhs: &IndexExpr, rhs: &IndexExpr) -> Result<String, MlirLowerError> {
        let a = self.index(lhs)?;
        let b = self.index(rhs)?;
        let dst = self.fresh();
        self.emit_line(&format!("{dst} = {op} {a}, {b} : index"));
        Ok(dst)
    }

    /// Emit `expr` as `index` arithmetic, returning the SSA value holding it.
    fn index(&mut self, expr: &IndexExpr) -> Result<String, MlirLowerError> {
        match expr {
            IndexExpr::Const(v) => Ok(self.constant(*v)),
            IndexExpr::Sym(Sym::Dim(dim)) => Ok(self.dim(*dim)),
            IndexExpr::Sym(Sym::Iv(var)) => self
                .loop_names
                .get(var)
                .cloned()
                .ok_or(MlirLowerError::UnboundLoopVar(*var)),
            IndexExpr::Add(a, b) => self.binary("arith.addi", a, b),
            IndexExpr::Sub(a, b) => self.binary("arith.subi", a, b),
            IndexExpr::Mul(a, b) => self.binary("arith.muli", a, b),
            IndexExpr::Max(a, b) => self.binary("arith.maxsi", a, b),
            IndexExpr::Min(a, b) => self.binary("arith.minsi", a, b),
            IndexExpr::FloorDiv(a, d) => self.binary("arith.floordivsi", a, &IndexExpr::Const(*d)),
            IndexExpr::CeilDiv(a, d) => self.binary("arith.ceildivsi", a, &IndexExpr::Const(*d)),
        }
    }

    fn indices(&mut self, exprs: &[IndexExpr]) -> Result<String, MlirLowerError> {
        let mut names = Vec::with_capacity(exprs.len());
        for e in exprs {
            names.push(self.index(e)?);
        }
        Ok(names.join(", "))
    }

    fn lower(&mut self) -> Result<(), MlirLowerError> {
        let nest = self.nest;
        let desc = &nest.descriptor;
        let elem = elem_type(desc.dtype);
        let output_ty = memref_type(&desc.output, desc.dtype);

        let mut dynamic = Vec::new();
        for extent in &desc.output {
            if let AxisExtent::Deferred(expr) = extent {
                dynamic.push(self.index(expr)?);
            }
        }
        self.emit_line(&format!("%output = memref.alloc({}) : {output_ty}", dynamic.join(", ")));
        self.emit_line(&format!("%acc = memref.alloca() : memref<{elem}>"));

        let reduction_depth = nest.band(BandKind::Reduction).map_or(0, |b| b.levels.len());
        for band in &nest.bands {
            if band.kind == BandKind::Reduction {
                self.emit_line(&format!("memref.store %zero, %acc[] : memref<{elem}>"));
            }
            for level in &band.levels {
                let lo = self.index(&level.bound.lower)?;
                let hi = self.index(&level.bound.upper)?;
                let step = self.constant(1);
                let name = format!("%{}", level.name);
                self.emit_line(&format!("scf.for {name} = {lo} to {hi} step {step} {{"));
                self.indent += 1;
            }
        }

        let image_ty = memref_type(&desc.image, desc.dtype);
        let filter_ty = memref_type(&desc.filter, desc.dtype);
        let image_idx = self.indices(&nest.body.image)?;
        let filter_idx = self.indices(&nest.body.filter)?;
        let x = self.fresh();
        self.emit_line(&format!("{x} = memref.load %image[{image_idx}] : {image_ty}"));
        let w = self.fresh();
        self.emit_line(&format!("{w} = memref.load %filter[{filter_idx}] : {filter_ty}"));
        let prod = self.fresh();
        self.emit_line(&format!("{prod} = arith.mulf {x}, {w} : {elem}"));
        let prev = self.fresh();
        self.emit_line(&format!("{prev} = memref.load %acc[] : memref<{elem}>"));
        let sum = self.fresh();
        self.emit_line(&format!("{sum} = arith.addf {prev}, {prod} : {elem}"));
        self.emit_line(&format!("memref.store {sum}, %acc[] : memref<{elem}>"));

        for _ in 0..reduction_depth {
            self.indent -= 1;
            self.emit_line("}");
        }

        let mut result = self.fresh();
        self.emit_line(&format!("{result} = memref.load %acc[] : memref<{elem}>"));
        if let (Some(index), Some(bias)) = (&nest.body.bias, &desc.bias) {
            let bias_ty = memref_type(bias, desc.dtype);
            let idx = self.index(index)?;
            let b = self.fresh();
            self.emit_line(&format!("{b} = memref.load %bias[{idx}] : {bias_ty}"));
            let biased = self.fresh();
            self.emit_line(&format!("{biased} = arith.addf {result}, {b} : {elem}"));
            result = biased;
        }
        let out_idx = self.indices(&nest.body.output)?;
        self.emit_line(&format!("memref.store {result}, %output[{out_idx}] : {output_ty}"));

        while self.indent > 2 {
            self.indent -= 1;
            self.emit_line("}");
        }
        self.emit_line(&format!("return %output : {output_ty}"));
        Ok(())
    }
}

fn const_name(value: i64) -> String {
    if value < 0 {
        format!("%c_neg{}", value.unsigned_abs())
    } else {
        format!("%c{value}")
    }
}

fn dim_name(dim: DimRef) -> String {
    format!("%{}_d{}", dim.operand, dim.axis)
}

fn elem_type(dtype: DType) -> &'static str {
    dtype.as_str()
}

fn memref_type(extents: &[AxisExtent], dtype: DType) -> String {
    let mut ty = String::from("memref<");
    for extent in extents {
        match extent {
            AxisExtent::Literal(n) => {
                let _ = write!(ty, "{n}x");
            }
            AxisExtent::Deferred(_) => ty.push_str("?x"),
        }
    }
    let _ = write!(ty, "{}>", elem_type(dtype));
    ty
}

fn operand_type(nest: &LoopNest, operand: Operand) -> String {
    let desc = &nest.descriptor;
    match operand {
        Operand::Image => memref_type(&desc.image, desc.dtype),
        Operand::Filter => memref_type(&desc.filter, desc.dtype),
        Operand::Bias => desc
            .bias
            .as_deref()
            .map_or_else(String::new, |b| memref_type(b, desc.dtype)),
    }
}

/// Lower a verified [`LoopNest`] into MLIR text over `scf`, `memref`, and
/// `arith`.
///
/// Deferred operand extents are read with `memref.dim`; the output buffer is
/// allocated with `memref.alloc`, sized by the same extent formulas the
/// executor evaluates. The lowering is deterministic: the same nest
/// produces identical text.
pub fn lower_loop_nest_to_mlir(nest: &LoopNest) -> Result<MlirModule, MlirLowerError> {
    verify_loop_nest(nest)?;

    let mut ctx = LoweringContext::new(nest);
    ctx.lower()?;

    let desc = &nest.descriptor;
    let mut params = vec![
        format!("%image: {}", operand_type(nest, Operand::Image)),
        format!("%filter: {}", operand_type(nest, Operand::Filter)),
    ];
    if desc.bias.is_some() {
        params.push(format!("%bias: {}", operand_type(nest, Operand::Bias)));
    }
    let output_ty = memref_type(&desc.output, desc.dtype);

    let mut out = String::new();
    out.push_str("module {\n");
    let _ = writeln!(
        out,
        "  func.func @{}({}) -> {output_ty} {{",
        sanitize_symbol(&desc.name),
        params.join(", ")
    );
    for value in &ctx.consts {
        let _ = writeln!(out, "    {} = arith.constant {value} : index", const_name(*value));
    }
    let _ = writeln!(
        out,
        "    %zero = arith.constant {} : {}",
        "0.000000e+00",
        elem_type(desc.dtype)
    );
    for dim in &ctx.dims {
        let _ = writeln!(
            out,
            "    {} = memref.dim %{}, {} : {}",
            dim_name(*dim),
            dim.operand,
            const_name(dim.axis as i64),
            operand_type(nest, dim.operand)
        );
    }
    out.push_str(&ctx.body);
    out.push_str("  }\n");
    out.push_str("}\n");

    Ok(MlirModule { text: out })
}

fn sanitize_symbol(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "conv".to_string()
    } else {
        cleaned
    }
}
