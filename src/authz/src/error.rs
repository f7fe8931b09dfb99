//! Error types for the permission engine

use thiserror::Error;

/// Permission engine errors
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Policy, role, user or durable-cache backing store failed
    #[error("Repository failure: {0}")]
    RepositoryFailure(String),

    /// Transient L1/L2 cache failure
    #[error("Cache error: {0}")]
    CacheFailure(String),

    /// Invalid engine or registry configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid policy definition
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Role hierarchy error
    #[error("Role graph error: {0}")]
    Graph(#[from] GraphError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation cancelled by the caller or by shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for AuthzError {
    fn from(err: serde_json::Error) -> Self {
        AuthzError::Serialization(err.to_string())
    }
}

/// Role hierarchy errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Circular dependency detected in the role graph
    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    /// Role id is duplicated
    #[error("Duplicate role: {0}")]
    DuplicateRole(String),

    /// Parent role does not exist in the business unit
    #[error("Role {role} references unknown parent {parent}")]
    UnknownParent { role: String, parent: String },
}

/// Result type for permission engine operations
pub type Result<T> = std::result::Result<T, AuthzError>;
