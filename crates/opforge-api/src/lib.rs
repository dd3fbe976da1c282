//! opforge API: host-facing contracts for the kernel generator
//!
//! The host graph executor owns tensor storage and operator ordering. It hands the
//! generator read-only [`TensorView`]s and attribute structures that were parsed and
//! cache-keyed up front; this crate defines both so that executors and generator
//! backends can depend on the contract without depending on each other.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod attributes;

pub use attributes::{
    Activation, AttributeError, AutoPad, ConvAttributes, RawConvAttributes, RawSoftmaxAttributes,
    SoftmaxAttributes,
};

/// Element types, tagged with their ONNX `TensorProto.DataType` numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32 = 1,
    Uint8 = 2,
    Int8 = 3,
    Uint16 = 4,
    Int16 = 5,
    Int32 = 6,
    Int64 = 7,
    Bool = 9,
    Float16 = 10,
    Float64 = 11,
    Uint32 = 12,
    Uint64 = 13,
}

impl DataType {
    pub fn from_onnx(tag: i32) -> Option<Self> {
        Some(match tag {
            1 => DataType::Float32,
            2 => DataType::Uint8,
            3 => DataType::Int8,
            4 => DataType::Uint16,
            5 => DataType::Int16,
            6 => DataType::Int32,
            7 => DataType::Int64,
            9 => DataType::Bool,
            10 => DataType::Float16,
            11 => DataType::Float64,
            12 => DataType::Uint32,
            13 => DataType::Uint64,
            _ => return None,
        })
    }

    pub fn onnx_tag(self) -> i32 {
        self as i32
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            DataType::Float16 | DataType::Float32 | DataType::Float64
        )
    }

    pub fn byte_size(self) -> usize {
        match self {
            DataType::Uint8 | DataType::Int8 | DataType::Bool => 1,
            DataType::Uint16 | DataType::Int16 | DataType::Float16 => 2,
            DataType::Float32 | DataType::Int32 | DataType::Uint32 => 4,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Uint8 => "uint8",
            DataType::Int8 => "int8",
            DataType::Uint16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Bool => "bool",
            DataType::Float16 => "float16",
            DataType::Float64 => "float64",
            DataType::Uint32 => "uint32",
            DataType::Uint64 => "uint64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a GPU buffer is used by the runtime. Generated programs bind every operand
/// as `Default`; the other kinds belong to upload staging and profiling buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuDataType {
    #[default]
    Default,
    Upload,
    Profile,
}

/// Opaque identifier of executor-owned tensor storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorHandle(pub u64);

impl fmt::Display for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only descriptor of a GPU-resident tensor. The storage behind `handle` belongs
/// to the executor; a view never extends its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorView {
    pub dims: Vec<usize>,
    pub data_type: DataType,
    pub handle: TensorHandle,
}

impl TensorView {
    pub fn new(dims: impl Into<Vec<usize>>, data_type: DataType, handle: TensorHandle) -> Self {
        Self {
            dims: dims.into(),
            data_type,
            handle,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements; a rank-0 view holds one element.
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Same storage seen through different dimensions. The element count must match.
    pub fn reshaped(&self, dims: impl Into<Vec<usize>>) -> Self {
        let dims = dims.into();
        debug_assert_eq!(dims.iter().product::<usize>(), self.size());
        Self {
            dims,
            data_type: self.data_type,
            handle: self.handle,
        }
    }
}

/// Axis order of a rank-4 activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TensorLayout {
    /// `[batch, channels, height, width]` (NCHW)
    #[default]
    #[serde(rename = "NCHW")]
    ChannelFirst,
    /// `[batch, height, width, channels]` (NHWC)
    #[serde(rename = "NHWC")]
    ChannelLast,
}

impl TensorLayout {
    pub fn parse(raw: &str) -> Result<Self, AttributeError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NCHW" | "CHANNEL_FIRST" | "CHANNELS_FIRST" => Ok(TensorLayout::ChannelFirst),
            "NHWC" | "CHANNEL_LAST" | "CHANNELS_LAST" => Ok(TensorLayout::ChannelLast),
            _ => Err(AttributeError::Unknown {
                name: "format",
                value: raw.to_string(),
            }),
        }
    }

    pub fn is_channel_last(self) -> bool {
        matches!(self, TensorLayout::ChannelLast)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TensorLayout::ChannelFirst => "NCHW",
            TensorLayout::ChannelLast => "NHWC",
        }
    }

    /// Position of the channel axis for a tensor of `rank` dimensions.
    pub fn channel_axis(self, rank: usize) -> usize {
        match self {
            TensorLayout::ChannelFirst => 1,
            TensorLayout::ChannelLast => rank.saturating_sub(1),
        }
    }

    /// Range of spatial axes for a tensor of `rank` dimensions.
    pub fn spatial_axes(self, rank: usize) -> std::ops::Range<usize> {
        match self {
            TensorLayout::ChannelFirst => 2..rank,
            TensorLayout::ChannelLast => 1..rank.saturating_sub(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn onnx_tags_round_trip_for_known_types() {
        for tag in [1, 2, 3, 4, 5, 6, 7, 9, 10, 11, 12, 13] {
            let dt = DataType::from_onnx(tag).expect("known tag");
            assert_eq!(dt.onnx_tag(), tag);
        }
        assert!(DataType::from_onnx(8).is_none());
        assert!(DataType::from_onnx(0).is_none());
    }

    #[test]
    fn only_float_types_report_is_float() {
        assert!(DataType::Float32.is_float());
        assert!(DataType::Float16.is_float());
        assert!(!DataType::Int32.is_float());
        assert!(!DataType::Bool.is_float());
    }

    #[test]
    fn layout_axes_follow_format() {
        assert_eq!(TensorLayout::ChannelFirst.channel_axis(4), 1);
        assert_eq!(TensorLayout::ChannelLast.channel_axis(4), 3);
        assert_eq!(TensorLayout::ChannelFirst.spatial_axes(4), 2..4);
        assert_eq!(TensorLayout::ChannelLast.spatial_axes(4), 1..3);
        assert_eq!(TensorLayout::parse("nhwc").unwrap(), TensorLayout::ChannelLast);
        assert!(TensorLayout::parse("NCDHW").is_err());
    }

    #[test]
    fn scalar_view_has_one_element() {
        let view = TensorView::new(Vec::new(), DataType::Float32, TensorHandle(3));
        assert_eq!(view.size(), 1);
        assert_eq!(view.rank(), 0);
    }
}
