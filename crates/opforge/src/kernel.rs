//! The closed set of kernel generators and operator entry points.

use crate::backend::host::HostTensor;
use crate::context::ComputeContext;
use crate::error::Result;
use crate::ops::conv_grouped::GroupedConv;
use crate::ops::softmax::SoftmaxKernel;
use crate::ops::{conv, softmax};
use crate::program::{ProgramInfo, ProgramMetadata, TensorInfo};
use opforge_api::{ConvAttributes, SoftmaxAttributes, TensorView};

/// A shader generator specialized by its attributes. Adding an operator adds a
/// variant here.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    GroupedConv(GroupedConv),
    Softmax(SoftmaxKernel),
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::GroupedConv(_) => GroupedConv::NAME,
            Kernel::Softmax(_) => SoftmaxKernel::NAME,
        }
    }

    pub fn metadata(&self, input_count: usize) -> ProgramMetadata {
        match self {
            Kernel::GroupedConv(k) => k.metadata(input_count),
            Kernel::Softmax(k) => k.metadata(),
        }
    }

    pub fn produce_descriptor(&self, inputs: &[TensorView]) -> Result<ProgramInfo> {
        match self {
            Kernel::GroupedConv(k) => k.program_info(inputs),
            Kernel::Softmax(k) => k.program_info(inputs),
        }
    }

    /// Run the kernel on host memory with the generated shader's arithmetic order.
    pub fn evaluate_host(
        &self,
        inputs: &[HostTensor<'_>],
        outputs: &[TensorInfo],
    ) -> Result<Vec<Vec<f32>>> {
        match self {
            Kernel::GroupedConv(k) => k.evaluate_host(inputs, outputs),
            Kernel::Softmax(k) => k.evaluate_host(inputs, outputs),
        }
    }
}

/// A graph operator with parsed attributes, ready to run against a context.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Conv(ConvAttributes),
    Softmax(SoftmaxAttributes),
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Conv(_) => "Conv",
            Operator::Softmax(_) => "Softmax",
        }
    }

    pub fn run(&self, context: &mut dyn ComputeContext) -> Result<()> {
        match self {
            Operator::Conv(attributes) => conv::conv(context, attributes),
            Operator::Softmax(attributes) => softmax::softmax(context, attributes),
        }
    }
}
