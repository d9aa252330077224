//! MIND convolution lowering.
//!
//! Lowers an N-dimensional convolution into a boundary-safe nested-loop plan
//! whose extents may be deferred to run time, then executes the plan on host
//! buffers or emits it as MLIR.
//!
//! ```
//! use mind_conv::ops::{ConvOp, OperandDecl};
//! use mind_conv::pipeline::{lower_conv, LowerOptions};
//!
//! let op = ConvOp::new(OperandDecl::known(&[1, 1, 32, 64]), OperandDecl::known(&[1, 1, 6, 7]));
//! let nest = lower_conv(&op, &LowerOptions::default()).unwrap();
//! assert!(nest.to_string().contains("output[1x1x27x58]"));
//! ```
pub mod conformance;
pub mod error;
pub mod exec;
pub mod instrument;
pub mod ops;
pub mod pipeline;
pub mod plan;
pub mod runtime;
pub mod shapes;
pub mod types;

#[cfg(feature = "mlir-lowering")]
pub mod mlir;

pub use error::ConvError;
pub use pipeline::{lower_conv, run_conv, LowerOptions};
