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

//! Declarative description of one convolution operator.
//!
//! Attribute names and conventions follow the ONNX `Conv` operator: shapes
//! use `-1` for unknown axes, `pads` lists all begin paddings followed by all
//! end paddings, and `auto_pad` selects the padding policy.
//!
//! ```
//! use mind_conv::ops::conv::{ConvOp, PaddingMode};
//!
//! let op = ConvOp::from_toml_str(r#"
//!     name = "conv1"
//!     group = 3
//!     strides = [2, 2]
//!     image = { shape = [-1, 9, 32, 64] }
//!     filter = { shape = [6, 3, 6, 7] }
//! "#).unwrap();
//! assert_eq!(op.padding_mode().unwrap(), PaddingMode::Explicit(vec![0, 0, 0, 0]));
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConvError;
use crate::types::{DType, ShapeDim, TensorType};

/// Padding policy applied to every spatial axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaddingMode {
    /// Caller-supplied pads, laid out as `[b0, b1, .., e0, e1, ..]`.
    Explicit(Vec<usize>),
    /// No padding at all.
    Valid,
    /// `ceil(I / S)` outputs, the odd padding element goes at the end.
    SameUpper,
    /// `ceil(I / S)` outputs, the odd padding element goes at the beginning.
    SameLower,
    /// Equal padding on both sides; an odd total is rounded down.
    SameSymmetric,
}

impl PaddingMode {
    /// Decode the ONNX `auto_pad` attribute together with its `pads` list.
    pub fn from_attr(auto_pad: &str, pads: Option<&[usize]>, spatial_rank: usize) -> Result<Self, ConvError> {
        match auto_pad {
            "NOTSET" | "" => {
                let pads = pads.map(<[usize]>::to_vec).unwrap_or_else(|| vec![0; 2 * spatial_rank]);
                if pads.len() != 2 * spatial_rank {
                    return Err(ConvError::unsupported(format!(
                        "pads has {} entries, expected {} for {} spatial axes",
                        pads.len(),
                        2 * spatial_rank,
                        spatial_rank
                    )));
                }
                Ok(PaddingMode::Explicit(pads))
            }
            "VALID" | "SAME_UPPER" | "SAME_LOWER" | "SAME_SYMMETRIC" if pads.is_some() => Err(
                ConvError::unsupported(format!("pads cannot be combined with auto_pad `{auto_pad}`")),
            ),
            "VALID" => Ok(PaddingMode::Valid),
            "SAME_UPPER" => Ok(PaddingMode::SameUpper),
            "SAME_LOWER" => Ok(PaddingMode::SameLower),
            "SAME_SYMMETRIC" => Ok(PaddingMode::SameSymmetric),
            other => Err(ConvError::unsupported(format!("unknown auto_pad mode `{other}`"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PaddingMode::Explicit(_) => "NOTSET",
            PaddingMode::Valid => "VALID",
            PaddingMode::SameUpper => "SAME_UPPER",
            PaddingMode::SameLower => "SAME_LOWER",
            PaddingMode::SameSymmetric => "SAME_SYMMETRIC",
        }
    }
}

/// Shape-only operand declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandDecl {
    pub shape: Vec<ShapeDim>,
}

impl OperandDecl {
    pub fn new(shape: Vec<ShapeDim>) -> Self {
        Self { shape }
    }

    /// All-literal declaration.
    pub fn known(shape: &[usize]) -> Self {
        Self {
            shape: shape.iter().map(|&n| ShapeDim::Known(n)).collect(),
        }
    }
}

fn default_group() -> usize {
    1
}

fn default_auto_pad() -> String {
    "NOTSET".to_string()
}

fn default_name() -> String {
    "conv".to_string()
}

/// A convolution operator as declared in a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvOp {
    /// Node name, used by instrumentation reports.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub dtype: DType,
    #[serde(default = "default_group")]
    pub group: usize,
    /// Per spatial axis; empty means all ones.
    #[serde(default)]
    pub strides: Vec<usize>,
    #[serde(default = "default_auto_pad")]
    pub auto_pad: String,
    #[serde(default)]
    pub pads: Option<Vec<usize>>,
    #[serde(default)]
    pub kernel_shape: Option<Vec<usize>>,
    #[serde(default)]
    pub dilations: Option<Vec<usize>>,
    // TOML tables must follow plain values when serialized.
    pub image: OperandDecl,
    pub filter: OperandDecl,
    #[serde(default)]
    pub bias: Option<OperandDecl>,
}

impl ConvOp {
    /// Minimal description: group 1, unit strides, no padding, no bias.
    pub fn new(image: OperandDecl, filter: OperandDecl) -> Self {
        Self {
            name: default_name(),
            dtype: DType::F32,
            image,
            filter,
            bias: None,
            group: 1,
            strides: Vec::new(),
            auto_pad: default_auto_pad(),
            pads: None,
            kernel_shape: None,
            dilations: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_bias(mut self, bias: OperandDecl) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn with_strides(mut self, strides: Vec<usize>) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_pads(mut self, pads: Vec<usize>) -> Self {
        self.auto_pad = default_auto_pad();
        self.pads = Some(pads);
        self
    }

    pub fn with_auto_pad(mut self, auto_pad: impl Into<String>) -> Self {
        self.auto_pad = auto_pad.into();
        self.pads = None;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse convolution description")
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Number of spatial axes implied by the image rank.
    pub fn spatial_rank(&self) -> usize {
        self.image.shape.len().saturating_sub(2)
    }

    pub fn padding_mode(&self) -> Result<PaddingMode, ConvError> {
        PaddingMode::from_attr(&self.auto_pad, self.pads.as_deref(), self.spatial_rank())
    }

    pub fn image_type(&self) -> TensorType {
        TensorType::new(self.dtype, self.image.shape.clone())
    }
}

/// Read a convolution description from a TOML file.
pub fn load_conv_op(path: &Path) -> Result<ConvOp> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    ConvOp::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_description() {
        let op = ConvOp::from_toml_str(
            r#"
            name = "stem"
            dtype = "f64"
            group = 1
            strides = [2, 2]
            auto_pad = "SAME_LOWER"
            kernel_shape = [3, 3]
            image = { shape = [-1, 3, -1, -1] }
            filter = { shape = [8, 3, 3, 3] }
            bias = { shape = [8] }
            "#,
        )
        .expect("parse");
        assert_eq!(op.name, "stem");
        assert_eq!(op.dtype, DType::F64);
        assert_eq!(op.image.shape[0], ShapeDim::Dynamic);
        assert_eq!(op.image.shape[1], ShapeDim::Known(3));
        assert_eq!(op.padding_mode(), Ok(PaddingMode::SameLower));
        assert_eq!(op.bias, Some(OperandDecl::known(&[8])));
    }

    #[test]
    fn unknown_auto_pad_is_unsupported() {
        let op = ConvOp::new(OperandDecl::known(&[1, 1, 4, 4]), OperandDecl::known(&[1, 1, 2, 2]))
            .with_auto_pad("REFLECT");
        assert!(matches!(
            op.padding_mode(),
            Err(ConvError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn explicit_pads_must_cover_every_axis() {
        let op = ConvOp::new(OperandDecl::known(&[1, 1, 4, 4]), OperandDecl::known(&[1, 1, 2, 2]))
            .with_pads(vec![1, 1]);
        assert!(matches!(
            op.padding_mode(),
            Err(ConvError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn auto_pad_rejects_explicit_pads() {
        let text = r#"
            auto_pad = "SAME_UPPER"
            pads = [1, 1, 1, 1]
            image = { shape = [1, 1, 4, 4] }
            filter = { shape = [1, 1, 3, 3] }
        "#;
        let op = ConvOp::from_toml_str(text).expect("parse");
        assert!(matches!(
            op.padding_mode(),
            Err(ConvError::UnsupportedConfiguration(_))
        ));

        let op = ConvOp::new(OperandDecl::known(&[1, 1, 4, 4]), OperandDecl::known(&[1, 1, 3, 3]))
            .with_pads(vec![1, 1, 1, 1])
            .with_auto_pad("VALID");
        assert_eq!(op.padding_mode(), Ok(PaddingMode::Valid));
    }

    #[test]
    fn toml_round_trip_keeps_dynamic_axes() {
        let op = ConvOp::new(
            OperandDecl::new(vec![ShapeDim::Dynamic, ShapeDim::Known(2), ShapeDim::Known(5)]),
            OperandDecl::known(&[4, 2, 3]),
        );
        let text = op.to_toml().expect("serialize");
        assert!(text.contains("-1"));
        assert_eq!(ConvOp::from_toml_str(&text).expect("parse"), op);
    }
}
