//! Error types for the composition and bring-up pipeline.

/// Result type alias for komposer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading a composition or bringing it up.
///
/// Precondition violations (registering a duplicate service name, registering
/// a service whose dependencies are already linked) are panics, not variants:
/// they indicate a bug in the caller and are not recoverable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Composition Loading Errors
    // =========================================================================
    /// Document decode or schema validation failure.
    #[error("{path}: {reason}")]
    Parse { path: String, reason: String },

    /// Service or path-component name rejection.
    #[error("invalid name {name:?}: {reason}")]
    Name { name: String, reason: String },

    /// Dependency cycle, unknown target, or readiness-level incompatibility.
    #[error("dependency graph error: {0}")]
    Graph(String),

    /// Mutually-exclusive configuration keys are both present.
    #[error("conflicting configuration: {0}")]
    Merge(String),

    // =========================================================================
    // File System Errors
    // =========================================================================
    /// A path component does not exist.
    #[error("file does not exist: {0}")]
    NotFound(String),

    /// The path already exists.
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// Lookup descended through a component that is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Symbolic-link substitution exceeded the link budget.
    #[error("too many levels of symbolic links: {0}")]
    TooManyLinks(String),

    /// A mkdir mode contained bits outside the permission mask.
    #[error("invalid directory mode {0:o}: only permission bits are allowed")]
    InvalidMode(u32),

    /// Fault seeded on an in-memory file system node.
    #[error("{0}")]
    Injected(String),

    // =========================================================================
    // Volume Pipeline Errors
    // =========================================================================
    /// A symbolic link resolves outside the bind-mount root.
    #[error("target of symlink {link:?} is outside the bind volume with host path {root:?} (resolves to {target:?})")]
    SymlinkEscape {
        link: String,
        target: String,
        root: String,
    },

    /// The host file is neither a symlink, a directory nor a regular file.
    #[error("file {0:?} is neither a symlink, a directory nor a regular file")]
    UnsupportedFileType(String),

    /// The tar writer cannot be safely reused; the caller must discard it.
    #[error("tar stream may be corrupt: {0}")]
    TarCorrupt(String),

    // =========================================================================
    // Image Build Errors
    // =========================================================================
    /// The external build service reported a failure.
    #[error("image build failed: {0}")]
    Build(String),

    /// The build progress stream ended without a recognizable image digest.
    #[error("could not parse image ID from build output stream")]
    BuildNoImageId,

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// A service selected for bring-up has no image to deploy.
    #[error("service {0:?} has no image to deploy")]
    NoImage(String),

    /// A subprocess-backed collaborator failed.
    #[error("command {command:?} failed: {reason}")]
    Subprocess { command: String, reason: String },

    /// The operation was aborted by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
