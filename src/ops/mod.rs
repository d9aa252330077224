//! Operator descriptions accepted by the lowering.

pub mod conv;

pub use conv::{load_conv_op, ConvOp, OperandDecl, PaddingMode};
