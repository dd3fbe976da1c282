//! Typed building blocks for generated WGSL.
//!
//! Generators never splice raw host numbers into shader text: shapes and attributes
//! go through the range-checked conversions below first, and tensors are accessed
//! through [`IndicesHelper`] so every generated module declares its bindings and
//! index helpers the same way.

mod helper;
mod indices;

pub use helper::{ShaderHelper, WorkgroupSize};
pub use indices::{IndicesHelper, VariableUsage};

use crate::error::{KernelError, Result};
use opforge_api::DataType;

/// Largest finite `f16`.
pub const F16_MAX: f32 = 65_504.0;

/// WGSL scalar types that tensor storage can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    F32,
    F16,
    I32,
    U32,
}

impl ScalarType {
    pub fn from_data_type(data_type: DataType) -> Result<Self> {
        match data_type {
            DataType::Float32 => Ok(ScalarType::F32),
            DataType::Float16 => Ok(ScalarType::F16),
            DataType::Int32 => Ok(ScalarType::I32),
            DataType::Uint32 | DataType::Bool => Ok(ScalarType::U32),
            other => Err(KernelError::UnsupportedDataType(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScalarType::F32 => "f32",
            ScalarType::F16 => "f16",
            ScalarType::I32 => "i32",
            ScalarType::U32 => "u32",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F16)
    }

    /// `T(0)`
    pub fn zero(self) -> String {
        format!("{}(0)", self.as_str())
    }

    /// Lowest finite value; the identity of a running `max`.
    pub fn lowest(self) -> &'static str {
        match self {
            ScalarType::F32 => "-3.402823e+38f",
            ScalarType::F16 => "-65504.0h",
            ScalarType::I32 => "(-2147483647i - 1i)",
            ScalarType::U32 => "0u",
        }
    }
}

/// Shape value baked into shader text as `u32`.
pub fn to_u32(name: &'static str, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| KernelError::out_of_range(name, value))
}

/// Shape value baked into shader text as `i32` (used where signed arithmetic is
/// needed, e.g. padded coordinates).
pub fn to_i32(name: &'static str, value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| KernelError::out_of_range(name, value))
}

/// `T(value)` for a float constant, printed at full `f64` precision so the literal is
/// exactly the `f32` the host holds. Non-finite values, and values outside the
/// `f16` range for `f16` shaders, are rejected.
pub fn float_literal(name: &'static str, value: f32, ty: ScalarType) -> Result<String> {
    if !value.is_finite() {
        return Err(KernelError::out_of_range(name, value));
    }
    match ty {
        ScalarType::F16 if value.abs() > F16_MAX => Err(KernelError::out_of_range(name, value)),
        ScalarType::F32 | ScalarType::F16 => Ok(format!("{}({:?})", ty.as_str(), f64::from(value))),
        ScalarType::I32 | ScalarType::U32 => Err(KernelError::out_of_range(name, value)),
    }
}

/// `vec2<i32>(a, b)`
pub fn vec2_i32(values: [i32; 2]) -> String {
    format!("vec2<i32>({}i, {}i)", values[0], values[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_literals_are_typed_and_checked() {
        assert_eq!(
            float_literal("alpha", 0.5, ScalarType::F32).unwrap(),
            "f32(0.5)"
        );
        assert_eq!(
            float_literal("alpha", -2.0, ScalarType::F16).unwrap(),
            "f16(-2.0)"
        );
        assert!(float_literal("alpha", f32::INFINITY, ScalarType::F32).is_err());
        assert!(float_literal("alpha", 1.0e6, ScalarType::F16).is_err());
        assert_eq!(
            float_literal("max", f32::MAX, ScalarType::F32).unwrap(),
            "f32(3.4028234663852886e38)"
        );
    }

    #[test]
    fn integer_conversions_are_range_checked() {
        assert_eq!(to_u32("dim", 7).unwrap(), 7);
        assert!(to_i32("dim", usize::MAX).is_err());
        #[cfg(target_pointer_width = "64")]
        assert!(to_u32("dim", 1usize << 40).is_err());
    }

    #[test]
    fn scalar_types_follow_data_types() {
        assert_eq!(
            ScalarType::from_data_type(DataType::Float16).unwrap(),
            ScalarType::F16
        );
        assert!(matches!(
            ScalarType::from_data_type(DataType::Float64),
            Err(KernelError::UnsupportedDataType(DataType::Float64))
        ));
    }
}
