use thiserror::Error;

use schist_ir::builder::BuildError;

#[derive(Debug, Clone, Error)]
pub enum CodegenError {
    #[error(transparent)]
    Build(#[from] BuildError),

    /// The layout repair pass could not bring every stack access within the
    /// VM's reach. Emission is abandoned; the caller may retry with a
    /// different pipeline configuration.
    #[error("stack too deep: {count} unreachable slot(s) ({details})")]
    StackTooDeep { count: usize, details: String },
}
