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

//! Symbolic integer algebra shared by extents, loop bounds, and accesses.
//!
//! Every constructor folds constants eagerly, so an expression whose leaves
//! are all literal collapses to [`IndexExpr::Const`] at construction time.
//! Expressions that still mention a [`Sym`] are evaluated later against a
//! [`SymEnv`], typically once the run-time operand shapes are known.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use super::Operand;

/// Reference to one axis of one operand, queried from the live buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimRef {
    pub operand: Operand,
    pub axis: usize,
}

/// Loop induction variable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopVar(pub usize);

/// Free symbol of an [`IndexExpr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sym {
    Dim(DimRef),
    Iv(LoopVar),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexExpr {
    Const(i64),
    Sym(Sym),
    Add(Box<IndexExpr>, Box<IndexExpr>),
    Sub(Box<IndexExpr>, Box<IndexExpr>),
    Mul(Box<IndexExpr>, Box<IndexExpr>),
    /// Floor division by a positive literal.
    FloorDiv(Box<IndexExpr>, i64),
    /// Ceiling division by a positive literal.
    CeilDiv(Box<IndexExpr>, i64),
    Max(Box<IndexExpr>, Box<IndexExpr>),
    Min(Box<IndexExpr>, Box<IndexExpr>),
}

/// Errors raised while evaluating an [`IndexExpr`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("symbol {0:?} is not bound in the evaluation environment")]
    Unbound(Sym),
    #[error("division by non-positive literal {0}")]
    NonPositiveDivisor(i64),
    #[error("integer overflow while evaluating index expression")]
    Overflow,
}

/// Lookup of symbol values during evaluation.
pub trait SymEnv {
    fn lookup(&self, sym: Sym) -> Option<i64>;
}

impl<F> SymEnv for F
where
    F: Fn(Sym) -> Option<i64>,
{
    fn lookup(&self, sym: Sym) -> Option<i64> {
        self(sym)
    }
}

/// Environment binding only induction variables, indexed by [`LoopVar`] slot.
#[derive(Debug, Clone, Copy)]
pub struct IvEnv<'a>(pub &'a [i64]);

impl SymEnv for IvEnv<'_> {
    fn lookup(&self, sym: Sym) -> Option<i64> {
        match sym {
            Sym::Iv(LoopVar(slot)) => self.0.get(slot).copied(),
            Sym::Dim(_) => None,
        }
    }
}

impl IndexExpr {
    pub fn constant(value: i64) -> Self {
        IndexExpr::Const(value)
    }

    pub fn dim(operand: Operand, axis: usize) -> Self {
        IndexExpr::Sym(Sym::Dim(DimRef { operand, axis }))
    }

    pub fn iv(var: LoopVar) -> Self {
        IndexExpr::Sym(Sym::Iv(var))
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            IndexExpr::Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.as_const().is_some()
    }

    pub fn add(lhs: IndexExpr, rhs: IndexExpr) -> IndexExpr {
        match (lhs, rhs) {
            (IndexExpr::Const(a), IndexExpr::Const(b)) => match a.checked_add(b) {
                Some(v) => IndexExpr::Const(v),
                None => IndexExpr::Add(Box::new(IndexExpr::Const(a)), Box::new(IndexExpr::Const(b))),
            },
            (x, IndexExpr::Const(0)) | (IndexExpr::Const(0), x) => x,
            // Keep constants on the right and merged: (x + a) + b => x + (a + b).
            (IndexExpr::Add(x, a), IndexExpr::Const(b))
                if a.as_const().and_then(|a| a.checked_add(b)).is_some() =>
            {
                let folded = a.as_const().and_then(|a| a.checked_add(b)).unwrap_or(b);
                IndexExpr::add(*x, IndexExpr::Const(folded))
            }
            (IndexExpr::Const(a), x) => IndexExpr::Add(Box::new(x), Box::new(IndexExpr::Const(a))),
            (x, y) => IndexExpr::Add(Box::new(x), Box::new(y)),
        }
    }

    pub fn sub(lhs: IndexExpr, rhs: IndexExpr) -> IndexExpr {
        match (lhs, rhs) {
            (IndexExpr::Const(a), IndexExpr::Const(b)) => match a.checked_sub(b) {
                Some(v) => IndexExpr::Const(v),
                None => IndexExpr::Sub(Box::new(IndexExpr::Const(a)), Box::new(IndexExpr::Const(b))),
            },
            (x, IndexExpr::Const(0)) => x,
            (x, IndexExpr::Const(b)) if b != i64::MIN => IndexExpr::add(x, IndexExpr::Const(-b)),
            (x, y) if x == y => IndexExpr::Const(0),
            (x, y) => IndexExpr::Sub(Box::new(x), Box::new(y)),
        }
    }

    pub fn mul(lhs: IndexExpr, rhs: IndexExpr) -> IndexExpr {
        match (lhs, rhs) {
            (IndexExpr::Const(a), IndexExpr::Const(b)) => match a.checked_mul(b) {
                Some(v) => IndexExpr::Const(v),
                None => IndexExpr::Mul(Box::new(IndexExpr::Const(a)), Box::new(IndexExpr::Const(b))),
            },
            (_, IndexExpr::Const(0)) | (IndexExpr::Const(0), _) => IndexExpr::Const(0),
            (x, IndexExpr::Const(1)) | (IndexExpr::Const(1), x) => x,
            (IndexExpr::Const(a), x) => IndexExpr::Mul(Box::new(x), Box::new(IndexExpr::Const(a))),
            (x, y) => IndexExpr::Mul(Box::new(x), Box::new(y)),
        }
    }

    pub fn floor_div(lhs: IndexExpr, divisor: i64) -> IndexExpr {
        match lhs {
            IndexExpr::Const(a) if divisor > 0 => IndexExpr::Const(a.div_euclid(divisor)),
            x if divisor == 1 => x,
            x => IndexExpr::FloorDiv(Box::new(x), divisor),
        }
    }

    pub fn ceil_div(lhs: IndexExpr, divisor: i64) -> IndexExpr {
        match lhs {
            IndexExpr::Const(a) if divisor > 0 && a != i64::MIN => {
                IndexExpr::Const(ceil_div_i64(a, divisor))
            }
            x if divisor == 1 => x,
            x => IndexExpr::CeilDiv(Box::new(x), divisor),
        }
    }

    pub fn max(lhs: IndexExpr, rhs: IndexExpr) -> IndexExpr {
        match (lhs, rhs) {
            (IndexExpr::Const(a), IndexExpr::Const(b)) => IndexExpr::Const(a.max(b)),
            (x, y) if x == y => x,
            (x, y) => IndexExpr::Max(Box::new(x), Box::new(y)),
        }
    }

    pub fn min(lhs: IndexExpr, rhs: IndexExpr) -> IndexExpr {
        match (lhs, rhs) {
            (IndexExpr::Const(a), IndexExpr::Const(b)) => IndexExpr::Const(a.min(b)),
            (x, y) if x == y => x,
            (x, y) => IndexExpr::Min(Box::new(x), Box::new(y)),
        }
    }

    /// Evaluate the expression against `env`.
    pub fn eval<E: SymEnv + ?Sized>(&self, env: &E) -> Result<i64, EvalError> {
        match self {
            IndexExpr::Const(v) => Ok(*v),
            IndexExpr::Sym(sym) => env.lookup(*sym).ok_or(EvalError::Unbound(*sym)),
            IndexExpr::Add(a, b) => a
                .eval(env)?
                .checked_add(b.eval(env)?)
                .ok_or(EvalError::Overflow),
            IndexExpr::Sub(a, b) => a
                .eval(env)?
                .checked_sub(b.eval(env)?)
                .ok_or(EvalError::Overflow),
            IndexExpr::Mul(a, b) => a
                .eval(env)?
                .checked_mul(b.eval(env)?)
                .ok_or(EvalError::Overflow),
            IndexExpr::FloorDiv(a, d) => {
                if *d <= 0 {
                    return Err(EvalError::NonPositiveDivisor(*d));
                }
                Ok(a.eval(env)?.div_euclid(*d))
            }
            IndexExpr::CeilDiv(a, d) => {
                if *d <= 0 {
                    return Err(EvalError::NonPositiveDivisor(*d));
                }
                let a = a.eval(env)?;
                if a == i64::MIN {
                    return Err(EvalError::Overflow);
                }
                Ok(ceil_div_i64(a, *d))
            }
            IndexExpr::Max(a, b) => Ok(a.eval(env)?.max(b.eval(env)?)),
            IndexExpr::Min(a, b) => Ok(a.eval(env)?.min(b.eval(env)?)),
        }
    }

    /// Rebuild the expression, replacing every symbol for which `f` yields a
    /// value. Constants are refolded on the way up.
    pub fn substitute<F>(&self, f: &F) -> IndexExpr
    where
        F: Fn(Sym) -> Option<IndexExpr>,
    {
        match self {
            IndexExpr::Const(v) => IndexExpr::Const(*v),
            IndexExpr::Sym(sym) => f(*sym).unwrap_or(IndexExpr::Sym(*sym)),
            IndexExpr::Add(a, b) => IndexExpr::add(a.substitute(f), b.substitute(f)),
            IndexExpr::Sub(a, b) => IndexExpr::sub(a.substitute(f), b.substitute(f)),
            IndexExpr::Mul(a, b) => IndexExpr::mul(a.substitute(f), b.substitute(f)),
            IndexExpr::FloorDiv(a, d) => IndexExpr::floor_div(a.substitute(f), *d),
            IndexExpr::CeilDiv(a, d) => IndexExpr::ceil_div(a.substitute(f), *d),
            IndexExpr::Max(a, b) => IndexExpr::max(a.substitute(f), b.substitute(f)),
            IndexExpr::Min(a, b) => IndexExpr::min(a.substitute(f), b.substitute(f)),
        }
    }

    /// Replace every `Dim` symbol resolved by `env` with its constant value.
    pub fn substitute_dims<E: SymEnv + ?Sized>(&self, env: &E) -> IndexExpr {
        self.substitute(&|sym| match sym {
            Sym::Dim(_) => env.lookup(sym).map(IndexExpr::Const),
            Sym::Iv(_) => None,
        })
    }

    /// Visit every free symbol in left-to-right order.
    pub fn for_each_sym(&self, visit: &mut dyn FnMut(Sym)) {
        match self {
            IndexExpr::Const(_) => {}
            IndexExpr::Sym(sym) => visit(*sym),
            IndexExpr::Add(a, b)
            | IndexExpr::Sub(a, b)
            | IndexExpr::Mul(a, b)
            | IndexExpr::Max(a, b)
            | IndexExpr::Min(a, b) => {
                a.for_each_sym(visit);
                b.for_each_sym(visit);
            }
            IndexExpr::FloorDiv(a, _) | IndexExpr::CeilDiv(a, _) => a.for_each_sym(visit),
        }
    }

    pub fn mentions_dims(&self) -> bool {
        let mut found = false;
        self.for_each_sym(&mut |sym| found |= matches!(sym, Sym::Dim(_)));
        found
    }

    /// Decompose into `constant + Σ coeff * iv` when the expression is affine
    /// in induction variables and free of operand dimensions.
    pub fn to_affine(&self) -> Option<AffineForm> {
        match self {
            IndexExpr::Const(v) => Some(AffineForm::constant(*v)),
            IndexExpr::Sym(Sym::Iv(var)) => Some(AffineForm::var(*var)),
            IndexExpr::Sym(Sym::Dim(_)) => None,
            IndexExpr::Add(a, b) => Some(a.to_affine()?.plus(&b.to_affine()?)),
            IndexExpr::Sub(a, b) => Some(a.to_affine()?.plus(&b.to_affine()?.scaled(-1))),
            IndexExpr::Mul(a, b) => {
                let (a, b) = (a.to_affine()?, b.to_affine()?);
                if a.terms.is_empty() {
                    Some(b.scaled(a.constant))
                } else if b.terms.is_empty() {
                    Some(a.scaled(b.constant))
                } else {
                    None
                }
            }
            IndexExpr::FloorDiv(..)
            | IndexExpr::CeilDiv(..)
            | IndexExpr::Max(..)
            | IndexExpr::Min(..) => None,
        }
    }

    /// Render with caller-provided symbol names.
    pub fn render(&self, name: &dyn Fn(Sym) -> String) -> String {
        let mut out = String::new();
        self.render_into(&mut out, name, Prec::Lowest);
        out
    }

    fn render_into(&self, out: &mut String, name: &dyn Fn(Sym) -> String, ctx: Prec) {
        match self {
            IndexExpr::Const(v) => {
                if *v < 0 && ctx > Prec::Lowest {
                    out.push_str(&format!("({v})"));
                } else {
                    out.push_str(&v.to_string());
                }
            }
            IndexExpr::Sym(sym) => out.push_str(&name(*sym)),
            IndexExpr::Add(a, b) => {
                // x + -3 reads better as x - 3.
                if let IndexExpr::Const(c) = **b {
                    if c < 0 {
                        paren(out, ctx > Prec::Sum, |out| {
                            a.render_into(out, name, Prec::Sum);
                            out.push_str(&format!(" - {}", -c));
                        });
                        return;
                    }
                }
                paren(out, ctx > Prec::Sum, |out| {
                    a.render_into(out, name, Prec::Sum);
                    out.push_str(" + ");
                    b.render_into(out, name, Prec::Sum);
                });
            }
            IndexExpr::Sub(a, b) => paren(out, ctx > Prec::Sum, |out| {
                a.render_into(out, name, Prec::Sum);
                out.push_str(" - ");
                b.render_into(out, name, Prec::Product);
            }),
            IndexExpr::Mul(a, b) => paren(out, ctx > Prec::Product, |out| {
                a.render_into(out, name, Prec::Product);
                out.push_str(" * ");
                b.render_into(out, name, Prec::Product);
            }),
            IndexExpr::FloorDiv(a, d) => {
                out.push_str("floordiv(");
                a.render_into(out, name, Prec::Lowest);
                out.push_str(&format!(", {d})"));
            }
            IndexExpr::CeilDiv(a, d) => {
                out.push_str("ceildiv(");
                a.render_into(out, name, Prec::Lowest);
                out.push_str(&format!(", {d})"));
            }
            IndexExpr::Max(a, b) | IndexExpr::Min(a, b) => {
                out.push_str(if matches!(self, IndexExpr::Max(..)) { "max(" } else { "min(" });
                a.render_into(out, name, Prec::Lowest);
                out.push_str(", ");
                b.render_into(out, name, Prec::Lowest);
                out.push(')');
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Lowest,
    Sum,
    Product,
}

fn paren(out: &mut String, wrap: bool, body: impl FnOnce(&mut String)) {
    if wrap {
        out.push('(');
    }
    body(out);
    if wrap {
        out.push(')');
    }
}

fn ceil_div_i64(a: i64, d: i64) -> i64 {
    -((-a).div_euclid(d))
}

/// Default symbol spelling: `dim(image, 2)` and `iv3`.
pub fn default_sym_name(sym: Sym) -> String {
    match sym {
        Sym::Dim(d) => format!("dim({}, {})", d.operand, d.axis),
        Sym::Iv(LoopVar(slot)) => format!("iv{slot}"),
    }
}

impl fmt::Display for LoopVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iv{}", self.0)
    }
}

impl fmt::Display for IndexExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&default_sym_name))
    }
}

impl From<i64> for IndexExpr {
    fn from(value: i64) -> Self {
        IndexExpr::Const(value)
    }
}

impl Add for IndexExpr {
    type Output = IndexExpr;
    fn add(self, rhs: IndexExpr) -> IndexExpr {
        IndexExpr::add(self, rhs)
    }
}

impl Add<i64> for IndexExpr {
    type Output = IndexExpr;
    fn add(self, rhs: i64) -> IndexExpr {
        IndexExpr::add(self, IndexExpr::Const(rhs))
    }
}

impl Sub for IndexExpr {
    type Output = IndexExpr;
    fn sub(self, rhs: IndexExpr) -> IndexExpr {
        IndexExpr::sub(self, rhs)
    }
}

impl Sub<i64> for IndexExpr {
    type Output = IndexExpr;
    fn sub(self, rhs: i64) -> IndexExpr {
        IndexExpr::sub(self, IndexExpr::Const(rhs))
    }
}

impl Mul for IndexExpr {
    type Output = IndexExpr;
    fn mul(self, rhs: IndexExpr) -> IndexExpr {
        IndexExpr::mul(self, rhs)
    }
}

impl Mul<i64> for IndexExpr {
    type Output = IndexExpr;
    fn mul(self, rhs: i64) -> IndexExpr {
        IndexExpr::mul(self, IndexExpr::Const(rhs))
    }
}

impl Neg for IndexExpr {
    type Output = IndexExpr;
    fn neg(self) -> IndexExpr {
        IndexExpr::sub(IndexExpr::Const(0), self)
    }
}

/// `constant + Σ coeff * iv`, terms sorted by slot with no zero coefficients.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AffineForm {
    pub constant: i64,
    pub terms: Vec<(LoopVar, i64)>,
}

impl AffineForm {
    pub fn constant(value: i64) -> Self {
        Self {
            constant: value,
            terms: Vec::new(),
        }
    }

    pub fn var(var: LoopVar) -> Self {
        Self {
            constant: 0,
            terms: vec![(var, 1)],
        }
    }

    pub fn scaled(&self, factor: i64) -> Self {
        if factor == 0 {
            return Self::constant(0);
        }
        Self {
            constant: self.constant * factor,
            terms: self.terms.iter().map(|&(v, c)| (v, c * factor)).collect(),
        }
    }

    pub fn plus(&self, other: &AffineForm) -> Self {
        let mut terms = self.terms.clone();
        for &(var, coeff) in &other.terms {
            match terms.binary_search_by_key(&var, |&(v, _)| v) {
                Ok(pos) => terms[pos].1 += coeff,
                Err(pos) => terms.insert(pos, (var, coeff)),
            }
        }
        terms.retain(|&(_, c)| c != 0);
        Self {
            constant: self.constant + other.constant,
            terms,
        }
    }

    /// Evaluate with induction variable values indexed by slot.
    #[inline]
    pub fn eval(&self, ivs: &[i64]) -> i64 {
        self.terms
            .iter()
            .fold(self.constant, |acc, &(LoopVar(slot), c)| acc + c * ivs[slot])
    }
}
