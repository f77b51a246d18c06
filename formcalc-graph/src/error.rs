use thiserror::Error;

/// Rejected graph mutations
///
/// A failed mutation leaves the graph exactly as it was.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Field name cannot be empty")]
    EmptyFieldName,

    #[error("Field '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Circular dependency: {}", path.join(" -> "))]
    CircularDependency {
        /// The cycle that the edge would close, starting and ending at the
        /// dependent field
        path: Vec<String>,
    },
}

pub type Result<T> = std::result::Result<T, GraphError>;
