//! Utilities shared by the mysql operator crates

/// Constants shared by the operator components
pub mod consts;
/// Random credential generation
pub mod credential;
/// Cluster schema version stamped in annotations
pub mod version;
