//! Constants for the composition loader and volume pipeline.
//!
//! Limits, defaults, and well-known strings are defined here to keep
//! magic numbers out of the rest of the codebase.

use std::time::Duration;

// =============================================================================
// Composition Documents
// =============================================================================

/// File loaded when no composition document is named on the command line.
pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";

/// Maximum size of a single composition document (4 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 4 * 1024 * 1024;

/// Default interval between health-probe attempts.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Default timeout for a single health-probe attempt.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of consecutive probe failures before a service is unhealthy.
pub const DEFAULT_PROBE_RETRIES: u32 = 3;

// =============================================================================
// File System
// =============================================================================

/// Symbolic-link substitutions allowed before a lookup fails.
pub const MAX_SYMLINK_FOLLOWS: u32 = 255;

/// Permission bits accepted by `mkdir`/`mkdir_all`.
pub const MODE_PERM_MASK: u32 = 0o777;

/// Mode used when the bind-path resolver creates missing leaf directories.
pub const BIND_DIR_MODE: u32 = 0o777;

// =============================================================================
// Image Build
// =============================================================================

/// Base image for volume-init images unless overridden by
/// `x-kube-compose.volume_init_base_image`.
pub const DEFAULT_BASE_IMAGE: &str = "ubuntu:latest";

/// Prefix of a fully-qualified image digest.
pub const SHA256_PREFIX: &str = "sha256:";

/// Hex digits in a sha-256 digest.
pub const SHA256_HEX_LEN: usize = 64;
