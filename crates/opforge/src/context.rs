use crate::error::Result;
use crate::program::ProgramInfoLoader;
use opforge_api::TensorView;

/// What an operator entry point sees of its executor: the operands it was invoked
/// with and a way to register one compute dispatch.
pub trait ComputeContext {
    fn inputs(&self) -> &[TensorView];

    /// Resolve `loader` (through the executor's cache), allocate the declared
    /// outputs and schedule the dispatch. Returns the output views in declaration
    /// order.
    fn compute(&mut self, loader: ProgramInfoLoader) -> Result<Vec<TensorView>>;
}
