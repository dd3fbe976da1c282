pub mod conv;
pub mod conv_grouped;
pub mod fuse_utils;
pub mod softmax;

pub use conv::conv;
pub use conv_grouped::{
    create_grouped_conv_program_info_loader, GroupedConv, OutputSqueeze, CONV_WORKGROUP_SIZE,
};
pub use softmax::{
    create_softmax_program_info_loader, softmax, SoftmaxKernel, SOFTMAX_WORKGROUP_SIZE,
};
