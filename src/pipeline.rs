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

//! High-level entry points tying the lowering stages together.
//!
//! [`lower_conv`] turns an operator description into a verified symbolic
//! loop nest; [`run_conv`] binds that nest to live buffers and executes it.
//! With the `mlir-lowering` feature, [`lower_conv_to_mlir`] emits the same
//! nest as MLIR text.

use ndarray::ArrayD;
use tracing::debug;

use crate::error::ConvError;
use crate::exec::{execute, observed_shape, ConvInputs};
use crate::instrument::{Instrument, MarkTag};
use crate::ops::ConvOp;
use crate::plan::{verify_loop_nest, LoopNest, PlanMarks, PlanVerifyError};
use crate::runtime::TensorRuntime;
use crate::shapes::build_descriptor;
use crate::types::Element;

#[cfg(feature = "mlir-lowering")]
use crate::mlir;

/// Operator name carried by instrumentation marks.
pub const CONV_OP_NAME: &str = "conv";

/// Which instrumentation marks to attach to a lowered plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstrumentOptions {
    pub before: bool,
    pub after: bool,
    pub report_time: bool,
    pub report_memory: bool,
}

impl InstrumentOptions {
    /// Before and after marks reporting both time and memory.
    pub fn all() -> Self {
        Self {
            before: true,
            after: true,
            report_time: true,
            report_memory: true,
        }
    }

    fn flags(&self) -> u64 {
        let mut flags = 0;
        if self.report_time {
            flags |= MarkTag::REPORT_TIME;
        }
        if self.report_memory {
            flags |= MarkTag::REPORT_MEMORY;
        }
        flags
    }
}

/// Options controlling [`lower_conv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerOptions {
    /// Run output planes on the rayon pool when the `parallel` feature is on.
    pub parallel: bool,
    /// Node name for instrumentation; the operator name when absent.
    pub node_name: Option<String>,
    pub instrument: InstrumentOptions,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            parallel: cfg!(feature = "parallel"),
            node_name: None,
            instrument: InstrumentOptions::default(),
        }
    }
}

impl LowerOptions {
    pub fn serial() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }
}

/// Errors surfaced by the combined lowering helpers.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Conv(#[from] ConvError),
    /// The assembled nest did not pass verification.
    #[error("loop nest verification failed: {0}")]
    Verify(#[from] PlanVerifyError),
    #[cfg(feature = "mlir-lowering")]
    #[error("MLIR lowering failed: {0}")]
    Mlir(#[from] mlir::MlirLowerError),
}

/// Lower `op` into a symbolic loop nest.
///
/// Every literal-extent check fires here; checks that depend on deferred
/// extents are postponed to [`LoopNest::bind`].
pub fn lower_conv(op: &ConvOp, opts: &LowerOptions) -> Result<LoopNest, ConvError> {
    let descriptor = build_descriptor(op)?;
    let mut nest = LoopNest::assemble(descriptor).with_parallel(opts.parallel);

    let marks = &opts.instrument;
    if marks.before || marks.after {
        let node = opts.node_name.as_deref().unwrap_or(&op.name);
        nest = nest.with_marks(PlanMarks::new(CONV_OP_NAME, node, marks.before, marks.after, marks.flags()));
    }
    debug!(op = %op.name, parallel = nest.parallel, marks = nest.marks.is_some(), "lowered convolution");
    Ok(nest)
}

/// Lower and verify in one step.
pub fn lower_and_verify(op: &ConvOp, opts: &LowerOptions) -> Result<LoopNest, PipelineError> {
    let nest = lower_conv(op, opts)?;
    verify_loop_nest(&nest)?;
    Ok(nest)
}

/// Bind `nest` to the shapes of `inputs` and execute it.
pub fn run_conv<T: Element, R: TensorRuntime>(
    nest: &LoopNest,
    inputs: &ConvInputs<'_, T>,
    runtime: &R,
    instrument: &dyn Instrument,
) -> Result<ArrayD<T>, ConvError> {
    let image = observed_shape(runtime, &inputs.image);
    let filter = observed_shape(runtime, &inputs.filter);
    let bias = inputs.bias.as_ref().map(|b| observed_shape(runtime, b));
    let plan = nest.bind(&image, &filter, bias.as_deref())?;
    execute(plan, inputs, runtime, instrument)
}

/// Lower `op` all the way to MLIR text.
#[cfg(feature = "mlir-lowering")]
pub fn lower_conv_to_mlir(op: &ConvOp, opts: &LowerOptions) -> Result<String, PipelineError> {
    let nest = lower_conv(op, opts)?;
    Ok(mlir::lower_loop_nest_to_mlir(&nest)?.text)
}
