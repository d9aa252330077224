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

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::plan::{Band, BandKind, ExecutionPlan, LoopBody, LoopNest};
use crate::types::extent::format_extents;
use crate::types::{IndexExpr, LoopVar, Sym};

/// Render a loop nest as stable, indented pseudo-code.
pub fn format_loop_nest(nest: &LoopNest) -> String {
    let desc = &nest.descriptor;
    let pads = desc
        .padding
        .axes
        .iter()
        .map(|p| format!("({}, {})", p.begin, p.end))
        .collect::<Vec<_>>()
        .join(", ");
    let mut header = format!(
        "conv @{} : {} image[{}] filter[{}]",
        desc.name,
        desc.dtype.as_str(),
        format_extents(&desc.image),
        format_extents(&desc.filter)
    );
    if let Some(bias) = &desc.bias {
        let _ = write!(header, " bias[{}]", format_extents(bias));
    }
    let _ = write!(
        header,
        " group {} -> output[{}]\n  pads {} [{}] strides {:?}",
        desc.group,
        format_extents(&desc.output),
        desc.padding.mode.name(),
        pads,
        desc.strides
    );
    render(&header, &nest.bands, &nest.body)
}

/// Render a bound plan; every extent is concrete.
pub fn format_execution_plan(plan: &ExecutionPlan) -> String {
    let dims = |shape: &[usize]| shape.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("x");
    let mut header = format!(
        "plan @{} : {} image[{}] filter[{}]",
        plan.name,
        plan.dtype.as_str(),
        dims(&plan.image_shape),
        dims(&plan.filter_shape)
    );
    if let Some(bias) = &plan.bias_shape {
        let _ = write!(header, " bias[{}]", dims(bias));
    }
    let _ = write!(header, " -> output[{}]", dims(&plan.output_shape));
    render(&header, &plan.bands, &plan.body)
}

fn render(header: &str, bands: &[Band], body: &LoopBody) -> String {
    let names: BTreeMap<LoopVar, String> = bands
        .iter()
        .flat_map(|b| b.levels.iter())
        .map(|l| (l.var, l.name.clone()))
        .collect();
    let name = |sym: Sym| match sym {
        Sym::Iv(var) => names.get(&var).cloned().unwrap_or_else(|| var.to_string()),
        Sym::Dim(d) => format!("dim({}, {})", d.operand, d.axis),
    };
    let expr = |e: &IndexExpr| e.render(&name);
    let tuple = |es: &[IndexExpr]| es.iter().map(&expr).collect::<Vec<_>>().join(", ");

    let mut out = String::new();
    let _ = writeln!(out, "{header}");
    let mut depth = 0usize;
    let pad = |depth: usize| "  ".repeat(depth);

    for band in bands {
        if band.kind == BandKind::Reduction {
            let _ = writeln!(out, "{}acc = 0", pad(depth));
        }
        for level in &band.levels {
            let _ = writeln!(
                out,
                "{}for {} in [{}, {}) {{",
                pad(depth),
                level.name,
                expr(&level.bound.lower),
                expr(&level.bound.upper)
            );
            depth += 1;
        }
    }

    let _ = writeln!(
        out,
        "{}acc += image[{}] * filter[{}]",
        pad(depth),
        tuple(&body.image),
        tuple(&body.filter)
    );

    let reduction = bands
        .iter()
        .find(|b| b.kind == BandKind::Reduction)
        .map_or(0, |b| b.levels.len());
    for _ in 0..reduction {
        depth -= 1;
        let _ = writeln!(out, "{}}}", pad(depth));
    }
    if let Some(bias) = &body.bias {
        let _ = writeln!(out, "{}acc += bias[{}]", pad(depth), expr(bias));
    }
    let _ = writeln!(out, "{}output[{}] = acc", pad(depth), tuple(&body.output));
    while depth > 0 {
        depth -= 1;
        let _ = writeln!(out, "{}}}", pad(depth));
    }
    out
}
