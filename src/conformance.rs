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

//! Built-in conformance suite.
//!
//! Each case lowers a convolution, runs it serially and in parallel, and
//! compares both against [`reference_conv`], which pads the image with
//! explicit zeros and then convolves with the full, unclipped window.

use ndarray::{indices, ArrayD, ArrayViewD, IxDyn, Slice};
use num_traits::cast;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::exec::ConvInputs;
use crate::instrument::NoInstrument;
use crate::ops::{ConvOp, OperandDecl, PaddingMode};
use crate::pipeline::{lower_conv, run_conv, LowerOptions};
use crate::runtime::HostRuntime;
use crate::types::{DType, Element, ShapeDim};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConformanceProfile {
    /// Small cases only.
    Quick,
    /// Adds larger 2-D and deferred 3-D cases.
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConformanceOptions {
    pub profile: ConformanceProfile,
    /// Seed for generated operand data.
    pub seed: u64,
}

impl Default for ConformanceOptions {
    fn default() -> Self {
        Self {
            profile: ConformanceProfile::Quick,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("conformance failures: {0:?}")]
pub struct ConformanceFailure(pub Vec<String>);

#[derive(Debug)]
struct ConformanceCase {
    name: &'static str,
    op: ConvOp,
    /// Concrete image shape the case runs with.
    image: Vec<usize>,
}

impl ConformanceCase {
    fn new(name: &'static str, op: ConvOp, image: &[usize]) -> Self {
        Self {
            name,
            op,
            image: image.to_vec(),
        }
    }
}

/// Run the conformance suite, collecting every failing case.
pub fn run_conformance(opts: ConformanceOptions) -> Result<(), ConformanceFailure> {
    let mut failures = Vec::new();
    let mut cases = quick_cases();
    if opts.profile == ConformanceProfile::Full {
        cases.extend(full_cases());
    }

    for (i, case) in cases.iter().enumerate() {
        let seed = opts.seed.wrapping_add(i as u64);
        let outcome = match case.op.dtype {
            DType::F32 => run_case::<f32>(case, seed, 1e-4),
            DType::F64 => run_case::<f64>(case, seed, 1e-10),
        };
        match outcome {
            Ok(()) => debug!(case = case.name, "conformance case passed"),
            Err(msg) => failures.push(format!("{} => {msg}", case.name)),
        }
    }

    info!(cases = cases.len(), failed = failures.len(), "conformance finished");
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ConformanceFailure(failures))
    }
}

fn run_case<T: Element>(case: &ConformanceCase, seed: u64, tolerance: f64) -> Result<(), String> {
    let op = &case.op;
    let image = seeded_tensor::<T>(&case.image, seed);
    let filter_shape = known_shape(&op.filter).ok_or("filter shape must be literal")?;
    let filter = seeded_tensor::<T>(&filter_shape, seed ^ 0xf1);
    let bias = match &op.bias {
        Some(decl) => Some(seeded_tensor::<T>(
            &known_shape(decl).ok_or("bias shape must be literal")?,
            seed ^ 0xb1,
        )),
        None => None,
    };

    let mut inputs = ConvInputs::new(image.view(), filter.view());
    if let Some(bias) = &bias {
        inputs = inputs.with_bias(bias.view());
    }

    let runtime = HostRuntime::default();
    let run = |parallel: bool| -> Result<ArrayD<T>, String> {
        let opts = LowerOptions {
            parallel,
            ..LowerOptions::default()
        };
        let nest = lower_conv(op, &opts).map_err(|e| format!("lowering failed: {e}"))?;
        #[cfg(feature = "mlir-lowering")]
        crate::mlir::lower_loop_nest_to_mlir(&nest).map_err(|e| format!("MLIR emission failed: {e}"))?;
        run_conv(&nest, &inputs, &runtime, &NoInstrument).map_err(|e| format!("execution failed: {e}"))
    };
    let serial = run(false)?;
    let parallel = run(true)?;
    if serial != parallel {
        return Err("serial and parallel outputs differ".to_string());
    }

    let mode = op.padding_mode().map_err(|e| e.to_string())?;
    let strides = if op.strides.is_empty() {
        vec![1; case.image.len() - 2]
    } else {
        op.strides.clone()
    };
    let pads = reference_pads(&mode, &case.image[2..], &filter_shape[2..], &strides);
    let expected = reference_conv(
        image.view(),
        filter.view(),
        bias.as_ref().map(|b| b.view()),
        op.group,
        &strides,
        &pads,
    );

    if serial.shape() != expected.shape() {
        return Err(format!(
            "output shape {:?}, reference {:?}",
            serial.shape(),
            expected.shape()
        ));
    }
    for ((idx, got), want) in serial.indexed_iter().zip(expected.iter()) {
        let (g, w) = (to_f64(*got), to_f64(*want));
        if (g - w).abs() > tolerance * (1.0 + w.abs()) {
            return Err(format!("output{idx:?} = {g}, reference {w}"));
        }
    }
    Ok(())
}

fn known_shape(decl: &OperandDecl) -> Option<Vec<usize>> {
    decl.shape.iter().map(ShapeDim::known).collect()
}

fn to_f64<T: Element>(v: T) -> f64 {
    cast::<T, f64>(v).unwrap_or(f64::NAN)
}

/// Deterministic uniform data in `[-1, 1)`.
pub fn seeded_tensor<T: Element>(shape: &[usize], seed: u64) -> ArrayD<T> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::from_shape_simple_fn(IxDyn(shape), || {
        cast::<f64, T>(rng.gen_range(-1.0..1.0)).unwrap_or_else(T::zero)
    })
}

/// Concrete `(begin, end)` pads for `mode` over the given spatial extents.
pub fn reference_pads(
    mode: &PaddingMode,
    input: &[usize],
    kernel: &[usize],
    strides: &[usize],
) -> Vec<(usize, usize)> {
    let rank = input.len();
    (0..rank)
        .map(|i| {
            let (len, k, s) = (input[i], kernel[i], strides[i]);
            let out = len.div_ceil(s);
            let total = ((out.max(1) - 1) * s + k).saturating_sub(len);
            match mode {
                PaddingMode::Explicit(pads) => (pads[i], pads[rank + i]),
                PaddingMode::Valid => (0, 0),
                PaddingMode::SameUpper => (total / 2, total - total / 2),
                PaddingMode::SameLower => (total - total / 2, total / 2),
                PaddingMode::SameSymmetric => (total / 2, total / 2),
            }
        })
        .collect()
}

/// Convolution over an explicitly zero-padded copy of `image`.
///
/// Every kernel position is visited, including those landing in padding, so
/// the result is independent of any window clipping.
pub fn reference_conv<T: Element>(
    image: ArrayViewD<'_, T>,
    filter: ArrayViewD<'_, T>,
    bias: Option<ArrayViewD<'_, T>>,
    group: usize,
    strides: &[usize],
    pads: &[(usize, usize)],
) -> ArrayD<T> {
    let ishape = image.shape();
    let fshape = filter.shape();
    let spatial = ishape.len() - 2;

    let mut padded_shape = ishape.to_vec();
    for (i, (b, e)) in pads.iter().enumerate() {
        padded_shape[2 + i] += b + e;
    }
    let mut padded = ArrayD::<T>::zeros(IxDyn(&padded_shape));
    padded
        .slice_each_axis_mut(|ax| match ax.axis.index() {
            a if a >= 2 => {
                let begin = pads[a - 2].0;
                Slice::from(begin..begin + ishape[a])
            }
            _ => Slice::from(..),
        })
        .assign(&image);

    let out_channels = fshape[0];
    let cin_per_group = fshape[1];
    let cout_per_group = out_channels / group;
    let kernel = &fshape[2..];

    let mut out_shape = vec![ishape[0], out_channels];
    for i in 0..spatial {
        let span = padded_shape[2 + i] as isize - kernel[i] as isize;
        out_shape.push(if span < 0 { 0 } else { span as usize / strides[i] + 1 });
    }

    let mut image_idx = vec![0usize; ishape.len()];
    let mut filter_idx = vec![0usize; fshape.len()];
    ArrayD::from_shape_fn(IxDyn(&out_shape), |out| {
        let (n, m) = (out[0], out[1]);
        let g = m / cout_per_group;
        let mut acc = T::zero();
        for c in 0..cin_per_group {
            image_idx[0] = n;
            image_idx[1] = g * cin_per_group + c;
            filter_idx[0] = m;
            filter_idx[1] = c;
            for k in indices(kernel) {
                for i in 0..spatial {
                    image_idx[2 + i] = out[2 + i] * strides[i] + k[i];
                    filter_idx[2 + i] = k[i];
                }
                acc = acc + padded[&image_idx[..]] * filter[&filter_idx[..]];
            }
        }
        if let Some(bias) = &bias {
            acc = acc + bias[&[m][..]];
        }
        acc
    })
}

fn dynamic(shape: &[i64]) -> OperandDecl {
    OperandDecl::new(
        shape
            .iter()
            .map(|&d| if d < 0 { ShapeDim::Dynamic } else { ShapeDim::Known(d as usize) })
            .collect(),
    )
}

fn quick_cases() -> Vec<ConformanceCase> {
    let known = OperandDecl::known;
    vec![
        ConformanceCase::new(
            "conv1d_valid",
            ConvOp::new(known(&[2, 3, 10]), known(&[4, 3, 3])).with_auto_pad("VALID").with_dtype(DType::F64),
            &[2, 3, 10],
        ),
        ConformanceCase::new(
            "conv1d_pads_stride_bias",
            ConvOp::new(known(&[1, 2, 11]), known(&[2, 2, 4]))
                .with_pads(vec![2, 1])
                .with_strides(vec![3])
                .with_bias(known(&[2]))
                .with_dtype(DType::F64),
            &[1, 2, 11],
        ),
        ConformanceCase::new(
            "conv1d_kernel_wider_than_image",
            ConvOp::new(known(&[1, 1, 2]), known(&[1, 1, 5])).with_pads(vec![2, 2]).with_dtype(DType::F64),
            &[1, 1, 2],
        ),
        ConformanceCase::new(
            "conv2d_same_upper",
            ConvOp::new(known(&[1, 3, 7, 9]), known(&[5, 3, 3, 4]))
                .with_auto_pad("SAME_UPPER")
                .with_strides(vec![2, 2])
                .with_bias(known(&[5]))
                .with_dtype(DType::F64),
            &[1, 3, 7, 9],
        ),
        ConformanceCase::new(
            "conv2d_same_lower",
            ConvOp::new(known(&[1, 3, 7, 9]), known(&[5, 3, 3, 4]))
                .with_auto_pad("SAME_LOWER")
                .with_strides(vec![2, 2])
                .with_dtype(DType::F64),
            &[1, 3, 7, 9],
        ),
        ConformanceCase::new(
            "conv2d_same_symmetric",
            ConvOp::new(known(&[1, 2, 6, 6]), known(&[2, 2, 3, 2]))
                .with_auto_pad("SAME_SYMMETRIC")
                .with_strides(vec![2, 1])
                .with_dtype(DType::F64),
            &[1, 2, 6, 6],
        ),
        ConformanceCase::new(
            "conv2d_grouped_asymmetric_pads",
            ConvOp::new(known(&[2, 4, 8, 10]), known(&[6, 2, 3, 3]))
                .with_group(2)
                .with_pads(vec![1, 0, 1, 2])
                .with_bias(known(&[6]))
                .with_dtype(DType::F64),
            &[2, 4, 8, 10],
        ),
        ConformanceCase::new(
            "conv2d_depthwise",
            ConvOp::new(known(&[1, 4, 6, 6]), known(&[4, 1, 3, 3]))
                .with_group(4)
                .with_pads(vec![1, 1, 1, 1])
                .with_dtype(DType::F64),
            &[1, 4, 6, 6],
        ),
        ConformanceCase::new(
            "conv2d_deferred_batch_and_spatial",
            ConvOp::new(dynamic(&[-1, 3, -1, -1]), known(&[4, 3, 3, 3]))
                .with_auto_pad("SAME_UPPER")
                .with_strides(vec![2, 2])
                .with_dtype(DType::F64),
            &[3, 3, 11, 8],
        ),
        ConformanceCase::new(
            "conv1d_deferred_padded_window",
            ConvOp::new(dynamic(&[-1, 2, -1]), known(&[2, 2, 5]))
                .with_pads(vec![3, 3])
                .with_bias(known(&[2]))
                .with_dtype(DType::F64),
            &[2, 2, 4],
        ),
        ConformanceCase::new(
            "conv3d_strided_bias",
            ConvOp::new(known(&[1, 2, 5, 6, 4]), known(&[3, 2, 2, 3, 2]))
                .with_pads(vec![1, 0, 1, 1, 1, 0])
                .with_strides(vec![1, 2, 1])
                .with_bias(known(&[3]))
                .with_dtype(DType::F64),
            &[1, 2, 5, 6, 4],
        ),
        ConformanceCase::new(
            "conv2d_f32",
            ConvOp::new(known(&[1, 2, 5, 5]), known(&[2, 2, 2, 2])).with_pads(vec![1, 1, 0, 0]),
            &[1, 2, 5, 5],
        ),
    ]
}

fn full_cases() -> Vec<ConformanceCase> {
    let known = OperandDecl::known;
    vec![
        ConformanceCase::new(
            "conv2d_grouped_large",
            ConvOp::new(dynamic(&[-1, 9, 32, 64]), known(&[6, 3, 6, 7]))
                .with_group(3)
                .with_dtype(DType::F64),
            &[1, 9, 32, 64],
        ),
        ConformanceCase::new(
            "conv2d_strided_large",
            ConvOp::new(known(&[1, 1, 32, 64]), known(&[1, 1, 6, 7]))
                .with_pads(vec![2, 3, 1, 3])
                .with_strides(vec![2, 2])
                .with_dtype(DType::F64),
            &[1, 1, 32, 64],
        ),
        ConformanceCase::new(
            "conv3d_deferred_same_lower",
            ConvOp::new(dynamic(&[-1, 2, -1, 5, -1]), known(&[2, 2, 3, 3, 3]))
                .with_auto_pad("SAME_LOWER")
                .with_bias(known(&[2]))
                .with_dtype(DType::F64),
            &[1, 2, 4, 5, 6],
        ),
    ]
}
