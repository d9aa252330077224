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

//! Direct interpretation of a bound convolution plan.
//!
//! Body accesses are flattened to affine offsets once, and the clipped
//! kernel windows are tabulated per output coordinate, so the inner loop is
//! plain integer arithmetic. The output is split into `(batch, channel)`
//! planes; each plane is written by exactly one task, in the same order
//! whether the planes run serially or on the rayon pool.

use ndarray::{ArrayD, ArrayViewD};
use tracing::debug;

use crate::error::ConvError;
use crate::instrument::Instrument;
use crate::plan::{BandKind, ExecutionPlan, LoopLevel};
use crate::runtime::{RuntimeError, TensorRuntime};
use crate::types::{AffineForm, Element, IndexExpr, IvEnv, LoopVar, Operand, Sym};

/// Borrowed operand buffers for one execution.
#[derive(Debug, Clone)]
pub struct ConvInputs<'a, T> {
    pub image: ArrayViewD<'a, T>,
    pub filter: ArrayViewD<'a, T>,
    pub bias: Option<ArrayViewD<'a, T>>,
}

impl<'a, T> ConvInputs<'a, T> {
    pub fn new(image: ArrayViewD<'a, T>, filter: ArrayViewD<'a, T>) -> Self {
        Self {
            image,
            filter,
            bias: None,
        }
    }

    pub fn with_bias(mut self, bias: ArrayViewD<'a, T>) -> Self {
        self.bias = Some(bias);
        self
    }
}

/// Shape of a live buffer as reported by the runtime.
pub fn observed_shape<T, R: TensorRuntime>(runtime: &R, buffer: &ArrayViewD<'_, T>) -> Vec<usize> {
    (0..buffer.ndim()).filter_map(|axis| runtime.extent(buffer, axis)).collect()
}

/// Execute `plan` against `inputs`, allocating the output through `runtime`.
///
/// The plan is consumed. Marks configured on the plan are reported through
/// `instrument` at entry and exit.
pub fn execute<T: Element, R: TensorRuntime>(
    plan: ExecutionPlan,
    inputs: &ConvInputs<'_, T>,
    runtime: &R,
    instrument: &dyn Instrument,
) -> Result<ArrayD<T>, ConvError> {
    check_shape(Operand::Image, &plan.image_shape, &observed_shape(runtime, &inputs.image))?;
    check_shape(Operand::Filter, &plan.filter_shape, &observed_shape(runtime, &inputs.filter))?;
    match (&plan.bias_shape, &inputs.bias) {
        (Some(expected), Some(bias)) => check_shape(Operand::Bias, expected, &observed_shape(runtime, bias))?,
        (None, None) => {}
        (Some(_), None) => return Err(ConvError::malformed(Operand::Bias, "plan expects a bias buffer")),
        (None, Some(_)) => return Err(ConvError::malformed(Operand::Bias, "plan has no bias operand")),
    }

    if let Some(marks) = &plan.marks {
        if let Some(tag) = marks.before {
            instrument.mark_point(&marks.op_name, &marks.node_name, tag);
        }
    }

    let image = inputs.image.as_standard_layout();
    let filter = inputs.filter.as_standard_layout();
    let bias = inputs.bias.as_ref().map(|b| b.as_standard_layout());
    let kernel = Kernel::compile(
        &plan,
        image.as_slice().ok_or(RuntimeError::NonContiguous)?,
        filter.as_slice().ok_or(RuntimeError::NonContiguous)?,
        match &bias {
            Some(b) => Some(b.as_slice().ok_or(RuntimeError::NonContiguous)?),
            None => None,
        },
    )?;

    let mut output = runtime.allocate::<T>(&plan.output_desc())?;
    let out = output.as_slice_mut().ok_or(RuntimeError::NonContiguous)?;
    debug!(
        op = %plan.name,
        planes = kernel.planes,
        plane = kernel.plane_len,
        parallel = plan.parallel,
        "executing convolution plan"
    );
    if !out.is_empty() {
        run_planes(&kernel, out, plan.parallel)?;
    }

    if let Some(marks) = &plan.marks {
        if let Some(tag) = marks.after {
            instrument.mark_point(&marks.op_name, &marks.node_name, tag);
        }
    }
    Ok(output)
}

#[cfg(feature = "parallel")]
fn run_planes<T: Element>(kernel: &Kernel<'_, T>, out: &mut [T], parallel: bool) -> Result<(), ConvError> {
    use rayon::prelude::*;

    if parallel {
        return out
            .par_chunks_mut(kernel.plane_len)
            .enumerate()
            .try_for_each(|(p, chunk)| kernel.run_plane(p, chunk));
    }
    out.chunks_mut(kernel.plane_len)
        .enumerate()
        .try_for_each(|(p, chunk)| kernel.run_plane(p, chunk))
}

#[cfg(not(feature = "parallel"))]
fn run_planes<T: Element>(kernel: &Kernel<'_, T>, out: &mut [T], _parallel: bool) -> Result<(), ConvError> {
    out.chunks_mut(kernel.plane_len)
        .enumerate()
        .try_for_each(|(p, chunk)| kernel.run_plane(p, chunk))
}

fn check_shape(operand: Operand, expected: &[usize], found: &[usize]) -> Result<(), ConvError> {
    if expected.len() != found.len() {
        return Err(ConvError::malformed(
            operand,
            format!("plan expects rank {}, buffer has rank {}", expected.len(), found.len()),
        ));
    }
    match expected.iter().zip(found).position(|(e, f)| e != f) {
        Some(axis) => Err(ConvError::ShapeMismatch {
            operand,
            axis,
            expected: expected[axis],
            found: found[axis],
        }),
        None => Ok(()),
    }
}

fn row_major_strides(shape: &[usize]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1] as i64;
    }
    strides
}

fn flatten(what: &str, indices: &[IndexExpr], shape: &[usize]) -> Result<AffineForm, ConvError> {
    let strides = row_major_strides(shape);
    let mut form = AffineForm::constant(0);
    for (index, stride) in indices.iter().zip(strides) {
        let affine = index.to_affine().ok_or_else(|| {
            ConvError::unsupported(format!("{what} index `{index}` is not affine in loop variables"))
        })?;
        form = form.plus(&affine.scaled(stride));
    }
    Ok(form)
}

fn const_range(level: &LoopLevel) -> Result<(i64, i64), ConvError> {
    match (level.bound.lower.as_const(), level.bound.upper.as_const()) {
        (Some(lo), Some(hi)) => Ok((lo, hi.max(lo))),
        _ => Err(ConvError::unsupported(format!(
            "loop `{}` has a non-constant range [{}, {})",
            level.name, level.bound.lower, level.bound.upper
        ))),
    }
}

/// Range of one reduction level.
enum Window {
    Fixed(i64, i64),
    /// Ranges indexed by the value of one spatial variable.
    Table {
        along: LoopVar,
        origin: i64,
        ranges: Vec<(i64, i64)>,
    },
}

struct Reduction {
    var: LoopVar,
    window: Window,
}

impl Reduction {
    #[inline]
    fn range(&self, ivs: &[i64]) -> (i64, i64) {
        match &self.window {
            Window::Fixed(lo, hi) => (*lo, *hi),
            Window::Table { along, origin, ranges } => ranges[(ivs[along.0] - origin) as usize],
        }
    }
}

struct Kernel<'a, T> {
    image: &'a [T],
    filter: &'a [T],
    bias: Option<&'a [T]>,
    image_at: AffineForm,
    filter_at: AffineForm,
    bias_at: Option<AffineForm>,
    output_at: AffineForm,
    slots: usize,
    outer: Vec<(LoopVar, i64, i64)>,
    spatial: Vec<(LoopVar, i64, i64)>,
    reduction: Vec<Reduction>,
    planes: usize,
    plane_len: usize,
}

impl<'a, T: Element> Kernel<'a, T> {
    fn compile(
        plan: &ExecutionPlan,
        image: &'a [T],
        filter: &'a [T],
        bias: Option<&'a [T]>,
    ) -> Result<Self, ConvError> {
        let band = |kind: BandKind| {
            plan.band(kind)
                .ok_or_else(|| ConvError::unsupported(format!("plan has no {kind} band")))
        };

        let outer = band(BandKind::Outer)?
            .levels
            .iter()
            .map(|l| const_range(l).map(|(lo, hi)| (l.var, lo, hi)))
            .collect::<Result<Vec<_>, _>>()?;
        let spatial = band(BandKind::Spatial)?
            .levels
            .iter()
            .map(|l| const_range(l).map(|(lo, hi)| (l.var, lo, hi)))
            .collect::<Result<Vec<_>, _>>()?;
        let slots = plan.vars.count();

        let mut reduction = Vec::new();
        for level in &band(BandKind::Reduction)?.levels {
            reduction.push(Reduction {
                var: level.var,
                window: tabulate(level, &spatial, slots)?,
            });
        }

        let planes: usize = outer.iter().map(|&(_, lo, hi)| (hi - lo) as usize).product();
        let plane_len: usize = spatial.iter().map(|&(_, lo, hi)| (hi - lo) as usize).product();
        if planes * plane_len != plan.output_desc().num_elements() {
            return Err(ConvError::invalid_shape(format!(
                "plan covers {planes} planes of {plane_len} elements, output has {}",
                plan.output_desc().num_elements()
            )));
        }

        let bias_at = match (&plan.body.bias, &plan.bias_shape) {
            (Some(index), Some(shape)) => Some(flatten("bias", std::slice::from_ref(index), shape)?),
            _ => None,
        };

        Ok(Self {
            image,
            filter,
            bias: bias_at.as_ref().and(bias),
            image_at: flatten("image", &plan.body.image, &plan.image_shape)?,
            filter_at: flatten("filter", &plan.body.filter, &plan.filter_shape)?,
            bias_at,
            output_at: flatten("output", &plan.body.output, &plan.output_shape)?,
            slots,
            outer,
            spatial,
            reduction,
            planes,
            plane_len,
        })
    }

    fn run_plane(&self, plane: usize, out: &mut [T]) -> Result<(), ConvError> {
        let mut ivs = vec![0i64; self.slots];
        let mut rest = plane;
        for &(var, lo, hi) in self.outer.iter().rev() {
            let count = (hi - lo) as usize;
            ivs[var.0] = lo + (rest % count) as i64;
            rest /= count;
        }
        let base = (plane * self.plane_len) as i64;
        self.sweep(0, &mut ivs, out, base)
    }

    fn sweep(&self, level: usize, ivs: &mut [i64], out: &mut [T], base: i64) -> Result<(), ConvError> {
        if let Some(&(var, lo, hi)) = self.spatial.get(level) {
            for v in lo..hi {
                ivs[var.0] = v;
                self.sweep(level + 1, ivs, out, base)?;
            }
            return Ok(());
        }

        let mut acc = T::zero();
        self.reduce(0, ivs, &mut acc)?;
        if let (Some(bias), Some(at)) = (self.bias, &self.bias_at) {
            acc = acc + load(bias, at.eval(ivs), Operand::Bias)?;
        }
        let offset = self.output_at.eval(ivs) - base;
        let slot = usize::try_from(offset)
            .ok()
            .and_then(|i| out.get_mut(i))
            .ok_or_else(|| ConvError::invalid_shape(format!("store offset {offset} outside its output plane")))?;
        *slot = acc;
        Ok(())
    }

    fn reduce(&self, level: usize, ivs: &mut [i64], acc: &mut T) -> Result<(), ConvError> {
        let Some(step) = self.reduction.get(level) else {
            let x = load(self.image, self.image_at.eval(ivs), Operand::Image)?;
            let w = load(self.filter, self.filter_at.eval(ivs), Operand::Filter)?;
            *acc = *acc + x * w;
            return Ok(());
        };
        let (lo, hi) = step.range(ivs);
        for v in lo..hi {
            ivs[step.var.0] = v;
            self.reduce(level + 1, ivs, acc)?;
        }
        Ok(())
    }
}

#[inline]
fn load<T: Copy>(buffer: &[T], offset: i64, operand: Operand) -> Result<T, ConvError> {
    usize::try_from(offset)
        .ok()
        .and_then(|i| buffer.get(i))
        .copied()
        .ok_or_else(|| ConvError::invalid_shape(format!("{operand} read at offset {offset} is out of bounds")))
}

/// Tabulate a reduction level's range. Its bounds may reference at most one
/// spatial variable.
fn tabulate(level: &LoopLevel, spatial: &[(LoopVar, i64, i64)], slots: usize) -> Result<Window, ConvError> {
    let mut used: Vec<LoopVar> = Vec::new();
    for expr in [&level.bound.lower, &level.bound.upper] {
        expr.for_each_sym(&mut |sym| {
            if let Sym::Iv(var) = sym {
                if !used.contains(&var) {
                    used.push(var);
                }
            }
        });
    }

    match used.as_slice() {
        [] => {
            let (lo, hi) = const_range(level)?;
            Ok(Window::Fixed(lo, hi))
        }
        [along] => {
            let &(_, origin, end) = spatial.iter().find(|(v, _, _)| v == along).ok_or_else(|| {
                ConvError::unsupported(format!(
                    "window of `{}` depends on {along}, which is not an output coordinate",
                    level.name
                ))
            })?;
            let mut ivs = vec![0i64; slots];
            let mut ranges = Vec::with_capacity((end - origin).max(0) as usize);
            for o in origin..end {
                ivs[along.0] = o;
                let (lo, hi) = level.bound.eval(&IvEnv(&ivs))?;
                ranges.push((lo, hi.max(lo)));
            }
            Ok(Window::Table {
                along: *along,
                origin,
                ranges,
            })
        }
        _ => Err(ConvError::unsupported(format!(
            "window of `{}` depends on more than one loop variable",
            level.name
        ))),
    }
}
