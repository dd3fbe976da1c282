//! Typed operator attributes.
//!
//! Raw attributes arrive from the model loader as loosely typed values. Parsing turns
//! them into validated structures carrying a precomputed cache key: a string that is
//! a pure function of every attribute field, so equal keys always mean equal
//! attributes.

use crate::TensorLayout;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lower clip bound used when a `Clip` activation does not provide one.
pub const DEFAULT_CLIP_MIN: f32 = -3.402_823_5e38;
/// Upper clip bound used when a `Clip` activation does not provide one.
pub const DEFAULT_CLIP_MAX: f32 = 3.402_823_5e38;
pub const DEFAULT_LEAKY_RELU_ALPHA: f32 = 0.01;
pub const DEFAULT_HARD_SIGMOID_ALPHA: f32 = 0.2;
pub const DEFAULT_HARD_SIGMOID_BETA: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttributeError {
    #[error("attribute '{name}' has invalid value {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("unknown {name} '{value}'")]
    Unknown { name: &'static str, value: String },
}

fn invalid(name: &'static str, value: impl ToString) -> AttributeError {
    AttributeError::InvalidValue {
        name,
        value: value.to_string(),
    }
}

/// Pointwise function fused into the tail of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activation {
    #[default]
    None,
    Relu,
    Sigmoid,
    Clip {
        min: f32,
        max: f32,
    },
    LeakyRelu {
        alpha: f32,
    },
    HardSigmoid {
        alpha: f32,
        beta: f32,
    },
}

impl Activation {
    /// Parse an activation name plus its positional parameters. An empty name means
    /// no activation. Missing parameters take the ONNX defaults.
    pub fn parse(name: &str, params: &[f32]) -> Result<Self, AttributeError> {
        if let Some(bad) = params.iter().find(|p| !p.is_finite()) {
            return Err(invalid("activation_params", bad));
        }
        let param = |idx: usize, default: f32| params.get(idx).copied().unwrap_or(default);
        let activation = match name.trim() {
            "" => Activation::None,
            "Relu" => Activation::Relu,
            "Sigmoid" => Activation::Sigmoid,
            "Clip" => Activation::Clip {
                min: param(0, DEFAULT_CLIP_MIN),
                max: param(1, DEFAULT_CLIP_MAX),
            },
            "LeakyRelu" => Activation::LeakyRelu {
                alpha: param(0, DEFAULT_LEAKY_RELU_ALPHA),
            },
            "HardSigmoid" => Activation::HardSigmoid {
                alpha: param(0, DEFAULT_HARD_SIGMOID_ALPHA),
                beta: param(1, DEFAULT_HARD_SIGMOID_BETA),
            },
            other => {
                return Err(AttributeError::Unknown {
                    name: "activation",
                    value: other.to_string(),
                })
            }
        };
        if let Activation::Clip { min, max } = activation {
            if min > max {
                return Err(invalid("activation_params", format!("[{min:?}, {max:?}]")));
            }
        }
        Ok(activation)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Activation::None)
    }

    pub fn cache_key(&self) -> String {
        match self {
            Activation::None => String::new(),
            Activation::Relu => "Relu".to_string(),
            Activation::Sigmoid => "Sigmoid".to_string(),
            Activation::Clip { min, max } => format!("Clip({min:?},{max:?})"),
            Activation::LeakyRelu { alpha } => format!("LeakyRelu({alpha:?})"),
            Activation::HardSigmoid { alpha, beta } => format!("HardSigmoid({alpha:?},{beta:?})"),
        }
    }

    /// Host-side evaluation with the same formulas the shader snippet uses.
    pub fn apply(&self, value: f32) -> f32 {
        match *self {
            Activation::None => value,
            Activation::Relu => value.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-value).exp()),
            Activation::Clip { min, max } => value.max(min).min(max),
            Activation::LeakyRelu { alpha } => {
                if value < 0.0 {
                    alpha * value
                } else {
                    value
                }
            }
            Activation::HardSigmoid { alpha, beta } => (alpha * value + beta).clamp(0.0, 1.0),
        }
    }
}

/// ONNX `auto_pad` modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoPad {
    #[default]
    NotSet,
    Valid,
    SameUpper,
    SameLower,
}

impl AutoPad {
    pub fn parse(raw: &str) -> Result<Self, AttributeError> {
        match raw.trim() {
            "" | "NOTSET" => Ok(AutoPad::NotSet),
            "VALID" => Ok(AutoPad::Valid),
            "SAME_UPPER" => Ok(AutoPad::SameUpper),
            "SAME_LOWER" => Ok(AutoPad::SameLower),
            other => Err(AttributeError::Unknown {
                name: "auto_pad",
                value: other.to_string(),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AutoPad::NotSet => "NOTSET",
            AutoPad::Valid => "VALID",
            AutoPad::SameUpper => "SAME_UPPER",
            AutoPad::SameLower => "SAME_LOWER",
        }
    }
}

/// Convolution attributes as the model loader provides them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConvAttributes {
    pub auto_pad: String,
    pub dilations: Vec<i64>,
    pub format: String,
    pub group: Option<i64>,
    pub kernel_shape: Vec<i64>,
    pub pads: Vec<i64>,
    pub strides: Vec<i64>,
    pub activation: String,
    pub activation_params: Vec<f32>,
}

fn non_negative(name: &'static str, values: &[i64]) -> Result<Vec<usize>, AttributeError> {
    values
        .iter()
        .map(|&v| usize::try_from(v).map_err(|_| invalid(name, v)))
        .collect()
}

fn positive(name: &'static str, values: &[i64]) -> Result<Vec<usize>, AttributeError> {
    let parsed = non_negative(name, values)?;
    if parsed.iter().any(|&v| v == 0) {
        return Err(invalid(name, format!("{values:?}")));
    }
    Ok(parsed)
}

/// Validated convolution attributes.
///
/// Empty `dilations`, `strides`, `pads` and `kernel_shape` mean "use the default for
/// the spatial rank"; the convolution entry point resolves them against the input
/// shapes via [`ConvAttributes::resolved`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConvAttributes {
    auto_pad: AutoPad,
    dilations: Vec<usize>,
    format: TensorLayout,
    group: usize,
    kernel_shape: Vec<usize>,
    pads: Vec<usize>,
    strides: Vec<usize>,
    activation: Activation,
    cache_key: String,
}

impl ConvAttributes {
    pub fn parse(raw: &RawConvAttributes) -> Result<Self, AttributeError> {
        let group = raw.group.unwrap_or(1);
        if group < 1 {
            return Err(invalid("group", group));
        }
        let format = if raw.format.trim().is_empty() {
            TensorLayout::ChannelFirst
        } else {
            TensorLayout::parse(&raw.format)?
        };
        let attrs = Self::new(
            AutoPad::parse(&raw.auto_pad)?,
            positive("dilations", &raw.dilations)?,
            format,
            usize::try_from(group).map_err(|_| invalid("group", group))?,
            positive("kernel_shape", &raw.kernel_shape)?,
            non_negative("pads", &raw.pads)?,
            positive("strides", &raw.strides)?,
            Activation::parse(&raw.activation, &raw.activation_params)?,
        );
        Ok(attrs)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auto_pad: AutoPad,
        dilations: Vec<usize>,
        format: TensorLayout,
        group: usize,
        kernel_shape: Vec<usize>,
        pads: Vec<usize>,
        strides: Vec<usize>,
        activation: Activation,
    ) -> Self {
        let mut attrs = Self {
            auto_pad,
            dilations,
            format,
            group: group.max(1),
            kernel_shape,
            pads,
            strides,
            activation,
            cache_key: String::new(),
        };
        attrs.cache_key = attrs.compute_cache_key();
        attrs
    }

    /// 2-D channel-first convolution with unit strides and dilations, no padding.
    pub fn basic(group: usize) -> Self {
        Self::new(
            AutoPad::NotSet,
            vec![1, 1],
            TensorLayout::ChannelFirst,
            group,
            Vec::new(),
            vec![0, 0, 0, 0],
            vec![1, 1],
            Activation::None,
        )
    }

    fn compute_cache_key(&self) -> String {
        format!(
            "{};{:?};{};{};{:?};{:?};{:?};{}",
            self.auto_pad.as_str(),
            self.dilations,
            self.format.as_str(),
            self.group,
            self.kernel_shape,
            self.pads,
            self.strides,
            self.activation.cache_key()
        )
    }

    /// Copy with fully resolved geometry; `auto_pad` becomes `NOTSET` since the pads
    /// now spell it out. The cache key is recomputed.
    pub fn resolved(
        &self,
        kernel_shape: Vec<usize>,
        pads: Vec<usize>,
        strides: Vec<usize>,
        dilations: Vec<usize>,
    ) -> Self {
        Self::new(
            AutoPad::NotSet,
            dilations,
            self.format,
            self.group,
            kernel_shape,
            pads,
            strides,
            self.activation,
        )
    }

    pub fn with_format(&self, format: TensorLayout) -> Self {
        let mut next = self.clone();
        next.format = format;
        next.cache_key = next.compute_cache_key();
        next
    }

    pub fn with_activation(&self, activation: Activation) -> Self {
        let mut next = self.clone();
        next.activation = activation;
        next.cache_key = next.compute_cache_key();
        next
    }

    pub fn with_pads(&self, pads: Vec<usize>) -> Self {
        let mut next = self.clone();
        next.pads = pads;
        next.cache_key = next.compute_cache_key();
        next
    }

    pub fn with_strides(&self, strides: Vec<usize>) -> Self {
        let mut next = self.clone();
        next.strides = strides;
        next.cache_key = next.compute_cache_key();
        next
    }

    pub fn with_dilations(&self, dilations: Vec<usize>) -> Self {
        let mut next = self.clone();
        next.dilations = dilations;
        next.cache_key = next.compute_cache_key();
        next
    }

    pub fn with_auto_pad(&self, auto_pad: AutoPad) -> Self {
        let mut next = self.clone();
        next.auto_pad = auto_pad;
        next.cache_key = next.compute_cache_key();
        next
    }

    pub fn auto_pad(&self) -> AutoPad {
        self.auto_pad
    }

    pub fn dilations(&self) -> &[usize] {
        &self.dilations
    }

    pub fn format(&self) -> TensorLayout {
        self.format
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn kernel_shape(&self) -> &[usize] {
        &self.kernel_shape
    }

    /// `[begin_0, .., begin_n, end_0, .., end_n]`
    pub fn pads(&self) -> &[usize] {
        &self.pads
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn activation(&self) -> &Activation {
        &self.activation
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSoftmaxAttributes {
    pub axis: Option<i64>,
}

/// Softmax attributes. `axis` is kept signed; it is normalized against the input
/// rank when the program is generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftmaxAttributes {
    axis: i64,
    cache_key: String,
}

impl SoftmaxAttributes {
    pub const DEFAULT_AXIS: i64 = -1;

    pub fn new(axis: i64) -> Self {
        Self {
            axis,
            cache_key: format!("{axis}"),
        }
    }

    pub fn parse(raw: &RawSoftmaxAttributes) -> Self {
        Self::new(raw.axis.unwrap_or(Self::DEFAULT_AXIS))
    }

    pub fn axis(&self) -> i64 {
        self.axis
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }
}

impl Default for SoftmaxAttributes {
    fn default() -> Self {
        Self::new(Self::DEFAULT_AXIS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_cache_key_tracks_every_field() {
        let base = ConvAttributes::basic(1);
        let grouped = ConvAttributes::basic(2);
        assert_ne!(base.cache_key(), grouped.cache_key());
        assert_ne!(
            base.cache_key(),
            base.with_format(TensorLayout::ChannelLast).cache_key()
        );
        assert_ne!(
            base.cache_key(),
            base.with_activation(Activation::Relu).cache_key()
        );
        assert_ne!(base.cache_key(), base.with_strides(vec![2, 2]).cache_key());
        assert_eq!(base.cache_key(), ConvAttributes::basic(1).cache_key());
    }

    #[test]
    fn parse_rejects_negative_and_zero_geometry() {
        let raw = RawConvAttributes {
            strides: vec![1, 0],
            ..Default::default()
        };
        assert!(ConvAttributes::parse(&raw).is_err());

        let raw = RawConvAttributes {
            pads: vec![0, -1, 0, 0],
            ..Default::default()
        };
        assert!(ConvAttributes::parse(&raw).is_err());

        let raw = RawConvAttributes {
            group: Some(0),
            ..Default::default()
        };
        assert!(ConvAttributes::parse(&raw).is_err());
    }

    #[test]
    fn parse_fills_defaults() {
        let attrs = ConvAttributes::parse(&RawConvAttributes::default()).expect("parse");
        assert_eq!(attrs.group(), 1);
        assert_eq!(attrs.format(), TensorLayout::ChannelFirst);
        assert_eq!(attrs.auto_pad(), AutoPad::NotSet);
        assert!(attrs.activation().is_none());
    }

    #[test]
    fn clip_defaults_and_ordering() {
        let clip = Activation::parse("Clip", &[]).expect("clip");
        assert_eq!(
            clip,
            Activation::Clip {
                min: DEFAULT_CLIP_MIN,
                max: DEFAULT_CLIP_MAX
            }
        );
        assert!(Activation::parse("Clip", &[1.0, -1.0]).is_err());
        assert!(Activation::parse("Swish", &[]).is_err());
        assert!(Activation::parse("LeakyRelu", &[f32::NAN]).is_err());
    }

    #[test]
    fn activation_host_formulas() {
        assert_eq!(Activation::Relu.apply(-2.0), 0.0);
        assert_eq!(Activation::LeakyRelu { alpha: 0.5 }.apply(-2.0), -1.0);
        assert_eq!(Activation::Clip { min: 0.0, max: 1.0 }.apply(3.0), 1.0);
        assert_eq!(Activation::Clip { min: 1.0, max: 0.0 }.apply(0.5), 0.0);
        let hs = Activation::HardSigmoid {
            alpha: 0.2,
            beta: 0.5,
        };
        assert!((hs.apply(0.0) - 0.5).abs() < 1e-6);
        assert!((Activation::Sigmoid.apply(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn softmax_axis_defaults_to_last() {
        let attrs = SoftmaxAttributes::parse(&RawSoftmaxAttributes::default());
        assert_eq!(attrs.axis(), -1);
        assert_eq!(attrs.cache_key(), "-1");
    }
}
