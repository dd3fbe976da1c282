//! Fused activations emitted into the tail of a kernel.

use crate::error::{KernelError, Result};
use crate::wgsl::{float_literal, ScalarType, F16_MAX};
use opforge_api::Activation;

/// `function` is a module-scope `fn apply_activation(v: T) -> T`; `apply` is the
/// statement that runs it on `value`. Both are empty when there is no activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationSnippet {
    pub function: String,
    pub apply: String,
}

pub fn activation_snippet(activation: &Activation, ty: ScalarType) -> Result<ActivationSnippet> {
    let t = ty.as_str();
    let body = match *activation {
        Activation::None => return Ok(ActivationSnippet::default()),
        Activation::Relu => format!("return max(v, {t}(0));"),
        Activation::Sigmoid => format!("return {t}(1) / ({t}(1) + exp(-v));"),
        Activation::Clip { min, max } => {
            if min.is_nan() || max.is_nan() || min > max {
                return Err(KernelError::invalid(format!(
                    "clip bounds must satisfy min <= max, got min={min}, max={max}"
                )));
            }
            let (min, max) = match ty {
                ScalarType::F16 => (min.max(-F16_MAX), max.min(F16_MAX)),
                _ => (min, max),
            };
            format!(
                "return clamp(v, {}, {});",
                float_literal("clip_min", min, ty)?,
                float_literal("clip_max", max, ty)?
            )
        }
        Activation::LeakyRelu { alpha } => format!(
            "return select({} * v, v, v >= {t}(0));",
            float_literal("alpha", alpha, ty)?
        ),
        Activation::HardSigmoid { alpha, beta } => format!(
            "return max({t}(0), min({t}(1), {} * v + {}));",
            float_literal("alpha", alpha, ty)?,
            float_literal("beta", beta, ty)?
        ),
    };
    Ok(ActivationSnippet {
        function: format!("fn apply_activation(v: {t}) -> {t} {{\n  {body}\n}}\n"),
        apply: "  value = apply_activation(value);\n".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_emits_nothing() {
        let snippet = activation_snippet(&Activation::None, ScalarType::F32).unwrap();
        assert!(snippet.function.is_empty());
        assert!(snippet.apply.is_empty());
    }

    #[test]
    fn relu_and_leaky_relu_bodies() {
        let relu = activation_snippet(&Activation::Relu, ScalarType::F32).unwrap();
        assert!(relu.function.contains("fn apply_activation(v: f32) -> f32"));
        assert!(relu.function.contains("return max(v, f32(0));"));
        assert_eq!(relu.apply, "  value = apply_activation(value);\n");

        let leaky =
            activation_snippet(&Activation::LeakyRelu { alpha: 0.5 }, ScalarType::F32).unwrap();
        assert!(leaky.function.contains("select(f32(0.5) * v, v, v >= f32(0))"));
    }

    #[test]
    fn clip_defaults_are_narrowed_for_f16() {
        let clip = Activation::Clip {
            min: opforge_api::attributes::DEFAULT_CLIP_MIN,
            max: opforge_api::attributes::DEFAULT_CLIP_MAX,
        };
        let f16 = activation_snippet(&clip, ScalarType::F16).unwrap();
        assert!(f16.function.contains("clamp(v, f16(-65504.0), f16(65504.0))"));
        let f32 = activation_snippet(&clip, ScalarType::F32).unwrap();
        assert!(f32.function.contains("f32(3.4028234663852886e38)"));
    }

    #[test]
    fn inverted_or_nan_clip_bounds_are_invalid() {
        for (min, max) in [(1.0, 0.0), (f32::NAN, 1.0), (0.0, f32::NAN)] {
            let err = activation_snippet(&Activation::Clip { min, max }, ScalarType::F32)
                .unwrap_err();
            assert!(err.is_invalid_argument(), "{err}");
        }
        let flat = activation_snippet(&Activation::Clip { min: 2.0, max: 2.0 }, ScalarType::F32)
            .unwrap();
        assert!(flat.function.contains("clamp(v, f32(2.0), f32(2.0))"));
    }
}
