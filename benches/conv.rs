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

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mind_conv::conformance::seeded_tensor;
use mind_conv::exec::ConvInputs;
use mind_conv::instrument::NoInstrument;
use mind_conv::ops::{ConvOp, OperandDecl};
use mind_conv::pipeline::{lower_conv, run_conv, LowerOptions};
use mind_conv::runtime::HostRuntime;
use mind_conv::types::ShapeDim;

/// 3x3 stride-1 convolution with unit padding.
fn conv_3x3() -> ConvOp {
    ConvOp::new(OperandDecl::known(&[1, 16, 32, 32]), OperandDecl::known(&[32, 16, 3, 3]))
        .with_pads(vec![1, 1, 1, 1])
        .with_bias(OperandDecl::known(&[32]))
}

/// Grouped 6x7 kernel over a batch-deferred image.
fn conv_grouped() -> ConvOp {
    let image = OperandDecl::new(vec![
        ShapeDim::Dynamic,
        ShapeDim::Known(9),
        ShapeDim::Known(32),
        ShapeDim::Known(64),
    ]);
    ConvOp::new(image, OperandDecl::known(&[6, 3, 6, 7])).with_group(3)
}

/// 5x5 stride-2 SAME_UPPER convolution with deferred spatial axes.
fn conv_5x5_same() -> ConvOp {
    let image = OperandDecl::new(vec![
        ShapeDim::Known(1),
        ShapeDim::Known(8),
        ShapeDim::Dynamic,
        ShapeDim::Dynamic,
    ]);
    ConvOp::new(image, OperandDecl::known(&[16, 8, 5, 5]))
        .with_strides(vec![2, 2])
        .with_auto_pad("SAME_UPPER")
}

fn cases() -> [(&'static str, ConvOp, Vec<usize>); 3] {
    [
        ("3x3_pad1", conv_3x3(), vec![1, 16, 32, 32]),
        ("grouped_6x7", conv_grouped(), vec![2, 9, 32, 64]),
        ("5x5_same_stride2", conv_5x5_same(), vec![1, 8, 48, 48]),
    ]
}

fn bench_lowering(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv_lowering");
    for (name, op, _) in cases() {
        group.bench_with_input(BenchmarkId::new("lower", name), &op, |b, op| {
            b.iter(|| lower_conv(black_box(op), &LowerOptions::default()).expect("lowering failed"));
        });
    }
    group.finish();
}

fn bench_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv_execution");
    group.sample_size(20);
    let runtime = HostRuntime::default();
    for (name, op, image_shape) in cases() {
        let image = seeded_tensor::<f32>(&image_shape, 1);
        let filter_shape: Vec<usize> = op.filter.shape.iter().filter_map(ShapeDim::known).collect();
        let filter = seeded_tensor::<f32>(&filter_shape, 2);
        let bias = op
            .bias
            .as_ref()
            .map(|decl| seeded_tensor::<f32>(&decl.shape.iter().filter_map(ShapeDim::known).collect::<Vec<_>>(), 3));
        let mut inputs = ConvInputs::new(image.view(), filter.view());
        if let Some(bias) = &bias {
            inputs = inputs.with_bias(bias.view());
        }

        for (mode, opts) in [("serial", LowerOptions::serial()), ("default", LowerOptions::default())] {
            let nest = lower_conv(&op, &opts).expect("lowering failed");
            group.bench_function(BenchmarkId::new(mode, name), |b| {
                b.iter(|| run_conv(black_box(&nest), &inputs, &runtime, &NoInstrument).expect("execution failed"));
            });
        }
    }
    group.finish();
}

#[cfg(feature = "mlir-lowering")]
fn bench_mlir(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv_mlir");
    for (name, op, _) in cases() {
        let nest = lower_conv(&op, &LowerOptions::default()).expect("lowering failed");
        group.bench_with_input(BenchmarkId::new("emit", name), &nest, |b, nest| {
            b.iter(|| mind_conv::mlir::lower_loop_nest_to_mlir(black_box(nest)).expect("emission failed"));
        });
    }
    group.finish();
}

#[cfg(not(feature = "mlir-lowering"))]
fn bench_mlir(_c: &mut Criterion) {}

criterion_group!(benches, bench_lowering, bench_execution, bench_mlir);
criterion_main!(benches);
