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

use mind_conv::conformance::seeded_tensor;
use mind_conv::exec::ConvInputs;
use mind_conv::instrument::NoInstrument;
use mind_conv::ops::{ConvOp, OperandDecl};
use mind_conv::pipeline::{lower_conv, run_conv, LowerOptions};
use mind_conv::runtime::HostRuntime;
use mind_conv::types::{Operand, ShapeDim};
use mind_conv::ConvError;
use ndarray::ArrayD;

fn masked(shape: &[usize], unknown: &[usize]) -> OperandDecl {
    OperandDecl::new(
        shape
            .iter()
            .enumerate()
            .map(|(axis, &n)| if unknown.contains(&axis) { ShapeDim::Dynamic } else { ShapeDim::Known(n) })
            .collect(),
    )
}

fn execute(op: &ConvOp, image: &ArrayD<f32>, filter: &ArrayD<f32>, bias: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>, ConvError> {
    let nest = lower_conv(op, &LowerOptions::serial())?;
    let mut inputs = ConvInputs::new(image.view(), filter.view());
    if let Some(bias) = bias {
        inputs = inputs.with_bias(bias.view());
    }
    run_conv(&nest, &inputs, &HostRuntime::default(), &NoInstrument)
}

#[test]
fn deferred_plan_matches_literal_plan() {
    let configs: [(&[usize], &[usize], &[usize], &str); 4] = [
        (&[2, 3, 11, 8], &[4, 3, 3, 3], &[0, 2, 3], "SAME_UPPER"),
        (&[1, 2, 9, 9], &[2, 2, 4, 2], &[2], "SAME_LOWER"),
        (&[3, 2, 10], &[2, 2, 3], &[0, 2], "VALID"),
        (&[1, 2, 5, 6, 7], &[2, 2, 2, 3, 2], &[0, 2, 3, 4], "SAME_SYMMETRIC"),
    ];
    for (seed, (ishape, fshape, unknown, mode)) in configs.into_iter().enumerate() {
        let literal = ConvOp::new(OperandDecl::known(ishape), OperandDecl::known(fshape))
            .with_auto_pad(mode)
            .with_strides(vec![2; ishape.len() - 2])
            .with_bias(OperandDecl::known(&[fshape[0]]));
        let deferred = ConvOp {
            image: masked(ishape, unknown),
            ..literal.clone()
        };

        let image = seeded_tensor::<f32>(ishape, seed as u64);
        let filter = seeded_tensor::<f32>(fshape, 50 + seed as u64);
        let bias = seeded_tensor::<f32>(&[fshape[0]], 90 + seed as u64);

        let a = execute(&literal, &image, &filter, Some(&bias)).expect("literal");
        let b = execute(&deferred, &image, &filter, Some(&bias)).expect("deferred");
        assert_eq!(a, b, "{mode}");
    }
}

#[test]
fn one_deferred_plan_serves_many_shapes() {
    let op = ConvOp::new(masked(&[0, 1, 0], &[0, 2]), OperandDecl::known(&[1, 1, 3])).with_pads(vec![1, 1]);
    let nest = lower_conv(&op, &LowerOptions::serial()).expect("lower");
    let filter = ArrayD::from_shape_vec(ndarray::IxDyn(&[1, 1, 3]), vec![1.0f32, 1.0, 1.0]).expect("filter");
    for len in [1usize, 2, 5] {
        let image = ArrayD::from_elem(ndarray::IxDyn(&[2, 1, len]), 1.0f32);
        let out = run_conv(
            &nest,
            &ConvInputs::new(image.view(), filter.view()),
            &HostRuntime::default(),
            &NoInstrument,
        )
        .expect("run");
        assert_eq!(out.shape(), &[2, 1, len]);
        let edge = if len == 1 { 1.0 } else { 2.0 };
        assert_eq!(out[[0, 0, 0]], edge);
        assert_eq!(out[[1, 0, len - 1]], edge);
    }
}

#[test]
fn empty_batch_yields_empty_output() {
    let op = ConvOp::new(masked(&[0, 2, 6], &[0]), OperandDecl::known(&[3, 2, 2]));
    let image = ArrayD::<f32>::zeros(ndarray::IxDyn(&[0, 2, 6]));
    let filter = ArrayD::<f32>::zeros(ndarray::IxDyn(&[3, 2, 2]));
    let out = execute(&op, &image, &filter, None).expect("run");
    assert_eq!(out.shape(), &[0, 3, 5]);
}

#[test]
fn image_too_small_at_run_time_is_invalid_shape() {
    let op = ConvOp::new(masked(&[1, 1, 0], &[2]), OperandDecl::known(&[1, 1, 5]));
    let nest = lower_conv(&op, &LowerOptions::serial()).expect("construction succeeds");
    let err = nest.bind(&[1, 1, 3], &[1, 1, 5], None).unwrap_err();
    assert!(matches!(err, ConvError::InvalidShape(_)), "{err:?}");
}

#[test]
fn deferred_channel_mismatch_is_reported_before_allocation() {
    let op = ConvOp::new(masked(&[1, 0, 4], &[1]), OperandDecl::known(&[2, 3, 2]));
    let image = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 4, 4]));
    let filter = ArrayD::<f32>::zeros(ndarray::IxDyn(&[2, 3, 2]));
    // A one-element budget would fail the output allocation; the shape
    // check has to fire first.
    let nest = lower_conv(&op, &LowerOptions::serial()).expect("lower");
    let err = run_conv(
        &nest,
        &ConvInputs::new(image.view(), filter.view()),
        &HostRuntime::with_limit(1),
        &NoInstrument,
    )
    .unwrap_err();
    assert_eq!(
        err,
        ConvError::ShapeMismatch {
            operand: Operand::Image,
            axis: 1,
            expected: 3,
            found: 4
        }
    );
}

#[test]
fn literal_axis_must_match_buffer() {
    let op = ConvOp::new(masked(&[1, 2, 6], &[0]), OperandDecl::known(&[1, 2, 2]));
    let nest = lower_conv(&op, &LowerOptions::serial()).expect("lower");
    let err = nest.bind(&[1, 2, 7], &[1, 2, 2], None).unwrap_err();
    assert_eq!(
        err,
        ConvError::ShapeMismatch {
            operand: Operand::Image,
            axis: 2,
            expected: 6,
            found: 7
        }
    );
}

#[test]
fn deferred_channels_not_divisible_by_group_match_literal_error() {
    let filter = OperandDecl::known(&[4, 3, 3]);
    let literal = ConvOp::new(OperandDecl::known(&[1, 9, 8]), filter.clone()).with_group(2);
    assert!(matches!(
        lower_conv(&literal, &LowerOptions::serial()),
        Err(ConvError::InvalidShape(_))
    ));

    let deferred = ConvOp::new(masked(&[1, 0, 8], &[1]), filter).with_group(2);
    let nest = lower_conv(&deferred, &LowerOptions::serial()).expect("lower");
    let err = nest.bind(&[1, 9, 8], &[4, 3, 3], None).unwrap_err();
    assert!(matches!(err, ConvError::InvalidShape(_)), "{err:?}");

    // Divisible but with the wrong per-group count is still a mismatch.
    let err = nest.bind(&[1, 8, 8], &[4, 3, 3], None).unwrap_err();
    assert_eq!(
        err,
        ConvError::ShapeMismatch {
            operand: Operand::Image,
            axis: 1,
            expected: 6,
            found: 8
        }
    );
}
