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
use mind_conv::plan::BandKind;
use mind_conv::shapes::build_descriptor;
use mind_conv::types::{AxisExtent, IvEnv, ShapeDim};

fn literal_output(op: &ConvOp) -> Vec<usize> {
    build_descriptor(op)
        .expect("descriptor")
        .output
        .iter()
        .map(|e| e.literal().expect("literal extent"))
        .collect()
}

#[test]
fn unit_stride_no_padding() {
    let op = ConvOp::new(OperandDecl::known(&[1, 1, 32, 64]), OperandDecl::known(&[1, 1, 6, 7]));
    assert_eq!(literal_output(&op), vec![1, 1, 27, 58]);
}

#[test]
fn grouped_output_channels_come_from_filter() {
    let op = ConvOp::new(OperandDecl::known(&[1, 9, 32, 64]), OperandDecl::known(&[6, 3, 6, 7])).with_group(3);
    let desc = build_descriptor(&op).expect("descriptor");
    assert_eq!(desc.in_channels_per_group(), 3);
    assert_eq!(desc.out_channels_per_group(), 2);
    assert_eq!(literal_output(&op), vec![1, 6, 27, 58]);
}

#[test]
fn strided_output_extent() {
    let op = ConvOp::new(OperandDecl::known(&[1, 1, 32, 64]), OperandDecl::known(&[1, 1, 6, 7]))
        .with_strides(vec![2, 2]);
    assert_eq!(literal_output(&op), vec![1, 1, 14, 29]);
}

#[test]
fn explicit_pads_enter_the_formula() {
    // floor((10 + 2 + 1 - 4) / 3) + 1 = 4
    let op = ConvOp::new(OperandDecl::known(&[1, 1, 10]), OperandDecl::known(&[1, 1, 4]))
        .with_pads(vec![2, 1])
        .with_strides(vec![3]);
    assert_eq!(literal_output(&op), vec![1, 1, 4]);
}

#[test]
fn same_modes_keep_ceil_extent() {
    for mode in ["SAME_UPPER", "SAME_LOWER"] {
        let op = ConvOp::new(OperandDecl::known(&[1, 1, 7, 9]), OperandDecl::known(&[1, 1, 3, 4]))
            .with_auto_pad(mode)
            .with_strides(vec![2, 2]);
        assert_eq!(literal_output(&op), vec![1, 1, 4, 5], "{mode}");
    }
}

#[test]
fn same_symmetric_drops_odd_remainder() {
    // total pad along the only axis is 3, so each side gets 1 and the
    // extent follows the general formula: (6 + 2 - 4) / 1 + 1 = 5.
    let op = ConvOp::new(OperandDecl::known(&[1, 1, 6]), OperandDecl::known(&[1, 1, 4]))
        .with_auto_pad("SAME_SYMMETRIC");
    let desc = build_descriptor(&op).expect("descriptor");
    assert_eq!(desc.padding.literal_pairs(), Some(vec![(1, 1)]));
    assert_eq!(literal_output(&op), vec![1, 1, 5]);
}

#[test]
fn deferred_extents_stay_symbolic_until_bound() {
    let image = OperandDecl::new(vec![ShapeDim::Dynamic, ShapeDim::Known(2), ShapeDim::Dynamic, ShapeDim::Known(12)]);
    let op = ConvOp::new(image, OperandDecl::known(&[4, 2, 3, 3]))
        .with_auto_pad("SAME_UPPER")
        .with_strides(vec![2, 3]);
    let desc = build_descriptor(&op).expect("descriptor");
    assert!(desc.output[0].is_deferred());
    assert_eq!(desc.output[1], AxisExtent::Literal(4));
    assert!(desc.output[2].is_deferred());
    assert_eq!(desc.output[3], AxisExtent::Literal(4));

    let nest = lower_conv(&op, &LowerOptions::default()).expect("lower");
    for (rows, expected) in [(1usize, 1usize), (9, 5), (10, 5), (31, 16)] {
        let plan = nest.bind(&[3, 2, rows, 12], &[4, 2, 3, 3], None).expect("bind");
        assert_eq!(plan.output_shape, vec![3, 4, expected, 4], "rows = {rows}");
    }
}

#[test]
fn strided_windows_read_inside_the_image() {
    let op = ConvOp::new(OperandDecl::known(&[1, 1, 32, 64]), OperandDecl::known(&[1, 1, 6, 7]))
        .with_strides(vec![2, 2]);
    let nest = lower_conv(&op, &LowerOptions::serial()).expect("lower");
    let plan = nest.bind(&[1, 1, 32, 64], &[1, 1, 6, 7], None).expect("bind");
    let reduction = plan.band(BandKind::Reduction).expect("reduction band");
    let vars = plan.vars;

    let mut ivs = vec![0i64; vars.count()];
    for (o0, o1) in [(0, 0), (5, 11), (13, 28)] {
        ivs[vars.out(0).0] = o0;
        ivs[vars.out(1).0] = o1;
        for (axis, limit) in [(0usize, 32i64), (1, 64)] {
            let (lo, hi) = reduction.levels[1 + axis].bound.eval(&IvEnv(&ivs)).expect("bounds");
            assert_eq!((lo, hi), (0, [6, 7][axis]), "no clipping without padding");
            for k in lo..hi {
                ivs[vars.kernel(axis).0] = k;
                let row = plan.body.image[2 + axis].eval(&IvEnv(&ivs)).expect("index");
                assert_eq!(row, ivs[vars.out(axis).0] * 2 + k);
                assert!((0..limit).contains(&row), "o{axis} read {row}");
            }
        }
    }
}

#[test]
fn padded_windows_are_clipped_at_both_edges() {
    let op = ConvOp::new(OperandDecl::known(&[1, 1, 5]), OperandDecl::known(&[1, 1, 3])).with_pads(vec![1, 1]);
    let nest = lower_conv(&op, &LowerOptions::serial()).expect("lower");
    let plan = nest.bind(&[1, 1, 5], &[1, 1, 3], None).expect("bind");
    let window = &plan.band(BandKind::Reduction).expect("reduction").levels[1].bound;
    let vars = plan.vars;

    let mut ivs = vec![0i64; vars.count()];
    let mut ranges = Vec::new();
    for o in 0..5 {
        ivs[vars.out(0).0] = o;
        ranges.push(window.eval(&IvEnv(&ivs)).expect("bounds"));
    }
    assert_eq!(ranges, vec![(1, 3), (0, 3), (0, 3), (0, 3), (0, 2)]);
}
