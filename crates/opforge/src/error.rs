use opforge_api::{AttributeError, DataType, TensorHandle};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    /// Wrong operand count, element type, axis or shape combination. Raised before
    /// any GPU work is scheduled.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A shape or attribute value that cannot be baked into shader text.
    #[error("constant '{name}' out of range for shader: {value}")]
    ConstantOutOfRange { name: &'static str, value: String },
    #[error("element type {0} is not supported by this backend")]
    UnsupportedDataType(DataType),
    #[error("unknown tensor {0}")]
    UnknownTensor(TensorHandle),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("failed to persist shader dump: {0}")]
    Persist(#[from] std::io::Error),
    #[error(transparent)]
    Attribute(#[from] AttributeError),
}

impl KernelError {
    pub fn invalid(message: impl Into<String>) -> Self {
        KernelError::InvalidArgument(message.into())
    }

    pub fn out_of_range(name: &'static str, value: impl ToString) -> Self {
        KernelError::ConstantOutOfRange {
            name,
            value: value.to_string(),
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            KernelError::InvalidArgument(_) | KernelError::Attribute(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
