//! Error taxonomy for graph compilation and rendering
//!
//! Graph construction never fails; every error below surfaces from
//! [`GraphCompiler::compile`](crate::GraphCompiler::compile) or
//! [`Executor::render`](crate::Executor::render).

use crate::graph::NodeId;

/// Errors returned by compilation and rendering
///
/// The type is `Clone` so that a single failed pipeline compile can be delivered
/// to every caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    /// The graph contains a cycle or a reference to a node that does not exist
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    /// A node names a filter that is not in the catalog
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),
    /// A node lacks an input its filter requires
    #[error("node {node} ({filter}) is missing required input '{input}'")]
    MissingRequiredInput { node: NodeId, filter: String, input: String },
    /// A node parameter is not part of its filter's schema or has the wrong kind
    #[error("invalid parameter '{key}' for filter '{filter}': {reason}")]
    InvalidParameter { filter: String, key: String, reason: String },
    /// The requested region cannot be produced as a bounded image
    #[error("unsupported region: {0}")]
    UnsupportedRegion(String),
    /// The filter is known but the shader registry has no source for it
    #[error("no shader registered for filter '{0}'")]
    ShaderNotFound(String),
    /// The device rejected the shader or pipeline
    #[error("pipeline compilation for '{filter}' failed: {message}")]
    CompilationFailed { filter: String, message: String },
    /// No adapter or device could be obtained
    #[error("GPU device unavailable: {0}")]
    DeviceUnavailable(String),
    /// An allocation exceeded device limits or memory
    #[error("GPU resources exhausted: {0}")]
    ResourceExhausted(String),
    /// The device was lost while work was in flight
    #[error("GPU device lost: {0}")]
    DeviceLost(String),
}
