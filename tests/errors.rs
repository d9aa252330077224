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

use mind_conv::ops::{ConvOp, OperandDecl};
use mind_conv::pipeline::{lower_conv, LowerOptions};
use mind_conv::types::{Operand, ShapeDim};
use mind_conv::ConvError;

fn lower(op: &ConvOp) -> Result<(), ConvError> {
    lower_conv(op, &LowerOptions::default()).map(|_| ())
}

fn conv2d() -> ConvOp {
    ConvOp::new(OperandDecl::known(&[1, 4, 8, 8]), OperandDecl::known(&[4, 2, 3, 3])).with_group(2)
}

#[test]
fn channels_not_divisible_by_group() {
    let op = ConvOp::new(OperandDecl::known(&[1, 9, 8, 8]), OperandDecl::known(&[4, 3, 3, 3])).with_group(3);
    assert!(matches!(lower(&op), Err(ConvError::InvalidShape(_))));

    let op = ConvOp::new(OperandDecl::known(&[1, 6, 8, 8]), OperandDecl::known(&[6, 3, 3, 3])).with_group(4);
    assert!(matches!(lower(&op), Err(ConvError::InvalidShape(_))));
}

#[test]
fn literal_channel_count_disagrees_with_filter() {
    let op = ConvOp::new(OperandDecl::known(&[1, 5, 8, 8]), OperandDecl::known(&[4, 2, 3, 3])).with_group(2);
    assert!(matches!(
        lower(&op),
        Err(ConvError::ShapeMismatch {
            operand: Operand::Image,
            axis: 1,
            ..
        }) | Err(ConvError::InvalidShape(_))
    ));
}

#[test]
fn kernel_larger_than_valid_image() {
    let op = ConvOp::new(OperandDecl::known(&[1, 1, 4, 4]), OperandDecl::known(&[1, 1, 5, 3])).with_auto_pad("VALID");
    assert!(matches!(lower(&op), Err(ConvError::InvalidShape(_))));
}

#[test]
fn unknown_padding_mode() {
    let op = conv2d().with_auto_pad("REFLECT");
    assert!(matches!(lower(&op), Err(ConvError::UnsupportedConfiguration(_))));
}

#[test]
fn degenerate_attributes_are_unsupported() {
    for op in [
        conv2d().with_group(0),
        conv2d().with_strides(vec![1, 0]),
        conv2d().with_strides(vec![1]),
        conv2d().with_pads(vec![1, 1]),
        ConvOp {
            dilations: Some(vec![2, 1]),
            ..conv2d()
        },
        ConvOp {
            kernel_shape: Some(vec![3]),
            ..conv2d()
        },
    ] {
        assert!(
            matches!(lower(&op), Err(ConvError::UnsupportedConfiguration(_))),
            "{op:?}"
        );
    }
}

#[test]
fn kernel_shape_attribute_must_match_filter() {
    let op = ConvOp {
        kernel_shape: Some(vec![3, 5]),
        ..conv2d()
    };
    assert!(matches!(lower(&op), Err(ConvError::InvalidShape(_))));

    let op = ConvOp {
        kernel_shape: Some(vec![3, 3]),
        dilations: Some(vec![1, 1]),
        ..conv2d()
    };
    assert!(lower(&op).is_ok());
}

#[test]
fn unresolved_weight_axes_are_malformed() {
    let filter = OperandDecl::new(vec![ShapeDim::Known(4), ShapeDim::Known(2), ShapeDim::Dynamic, ShapeDim::Known(3)]);
    let op = ConvOp::new(OperandDecl::known(&[1, 4, 8, 8]), filter).with_group(2);
    assert!(matches!(
        lower(&op),
        Err(ConvError::MalformedOperand {
            operand: Operand::Filter,
            ..
        })
    ));

    let op = conv2d().with_bias(OperandDecl::new(vec![ShapeDim::Dynamic]));
    assert!(matches!(
        lower(&op),
        Err(ConvError::MalformedOperand {
            operand: Operand::Bias,
            ..
        })
    ));
}

#[test]
fn rank_errors_are_malformed() {
    let op = ConvOp::new(OperandDecl::known(&[1, 4]), OperandDecl::known(&[4, 4]));
    assert!(matches!(lower(&op), Err(ConvError::MalformedOperand { .. })));

    let op = ConvOp::new(OperandDecl::known(&[1, 4, 8, 8]), OperandDecl::known(&[4, 4, 3]));
    assert!(matches!(
        lower(&op),
        Err(ConvError::MalformedOperand {
            operand: Operand::Filter,
            ..
        })
    ));
}

#[test]
fn bias_length_must_match_output_channels() {
    let op = conv2d().with_bias(OperandDecl::known(&[3]));
    assert!(matches!(
        lower(&op),
        Err(ConvError::ShapeMismatch {
            operand: Operand::Bias,
            axis: 0,
            ..
        })
    ));
}

#[test]
fn oversized_literals_are_rejected_while_lowering() {
    let huge = i64::MAX as usize;
    let op = ConvOp::new(OperandDecl::known(&[1, 1, 10]), OperandDecl::known(&[1, 1, 3])).with_pads(vec![huge, 0]);
    assert!(matches!(lower(&op), Err(ConvError::InvalidShape(_))));

    let op = ConvOp::new(OperandDecl::known(&[1, 1, 10]), OperandDecl::known(&[1, 1, 3])).with_pads(vec![usize::MAX, 0]);
    assert!(matches!(lower(&op), Err(ConvError::InvalidShape(_))));

    let op = ConvOp::new(OperandDecl::known(&[1, 1, huge]), OperandDecl::known(&[1, 1, 1])).with_pads(vec![1, 1]);
    assert!(matches!(lower(&op), Err(ConvError::InvalidShape(_))));
}

#[test]
fn errors_render_their_kind() {
    let err = lower(&conv2d().with_auto_pad("REFLECT")).unwrap_err();
    assert!(err.to_string().starts_with("unsupported configuration"));
}
