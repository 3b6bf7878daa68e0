use thiserror::Error;

/// Errors raised by the connectivity and routing data model.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A shape invariant was violated: zero port counts, identical or empty
    /// module IDs, an out-of-range port index, or a self-referential edge.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// An operation referenced a module ID the object does not know about.
    #[error("unknown module ID: {0}")]
    UnknownModule(String),

    /// A parameter write used a different element type than the one fixed
    /// at the parameter's first write.
    #[error("parameter type mismatch: {0}")]
    TypeMismatch(String),
}
