//! Composition data model.
//!
//! Normalized, canonical representations of the multi-shape YAML keys.
//! The parser collapses each dynamic shape (`environment` as map or list,
//! `depends_on` as list or map of conditions, `ports` as numbers or
//! strings) into exactly one of the types below before the merger ever
//! sees a service.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Readiness level a dependent service requires of its antecedent.
///
/// Ordered: `Started < Healthy`, so merged dependency maps can promote
/// the required level with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Readiness {
    /// The antecedent's primary process has been created.
    Started,
    /// The antecedent's health probe has succeeded at least once.
    Healthy,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "service_started"),
            Self::Healthy => write!(f, "service_healthy"),
        }
    }
}

/// A published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    /// Host port, when the document named one.
    pub host: Option<u16>,
    /// Container port.
    pub container: u16,
}

/// A bind-mount declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindMount {
    /// Host path as written in the document; canonicalized later by the
    /// bind-path resolver.
    pub host_path: String,
    /// Absolute mount point inside the container.
    pub container_path: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// A health probe definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthProbe {
    /// Probe command vector (`CMD` / `CMD-SHELL` form).
    pub test: Vec<String>,
    /// Interval between probe attempts.
    pub interval: Duration,
    /// Timeout for a single attempt.
    pub timeout: Duration,
    /// Consecutive failures before the service is considered unhealthy.
    pub retries: u32,
}

/// A service's `healthcheck` key after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HealthcheckSpec {
    /// Probing explicitly disabled (`disable: true` or `test: [NONE]`).
    Disabled,
    /// An enabled probe.
    Probe(HealthProbe),
}

impl HealthcheckSpec {
    /// Returns the probe when one is enabled.
    pub fn probe(&self) -> Option<&HealthProbe> {
        match self {
            Self::Probe(p) => Some(p),
            Self::Disabled => None,
        }
    }
}

/// One service as described by a composition document, after shape
/// normalization and `extends` resolution.
///
/// Environment values are `None` when the variable is passed through from
/// the caller's environment (list form, bare `KEY`). A key set to null in
/// the document is omitted from the map entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComposeService {
    /// Image reference.
    pub image: Option<String>,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// User the container runs as.
    pub user: Option<String>,
    /// Environment variables, sorted by key.
    pub environment: BTreeMap<String, Option<String>>,
    /// Published ports in document order; duplicates preserved.
    pub ports: Vec<PortBinding>,
    /// Bind mounts in document order.
    pub volumes: Vec<BindMount>,
    /// Health probe, when the document specified one.
    pub healthcheck: Option<HealthcheckSpec>,
    /// Required antecedents by name; resolved to indices by the merger.
    pub depends_on: BTreeMap<String, Readiness>,
}

impl ComposeService {
    /// Returns true when an enabled health probe is defined.
    pub fn probe_enabled(&self) -> bool {
        matches!(self.healthcheck, Some(HealthcheckSpec::Probe(_)))
    }
}

/// Where volume-init images are stored for the cluster to pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClusterImageStorage {
    /// Images stay in the local daemon's store.
    Docker,
    /// Images are pushed to a registry.
    DockerRegistry {
        /// Registry host.
        host: String,
    },
}

impl Default for ClusterImageStorage {
    fn default() -> Self {
        Self::Docker
    }
}

/// The `x-kube-compose` extension block of one document.
///
/// `push_images` is the legacy spelling of registry storage; it is kept
/// separate from `cluster_image_storage` so the mutual-exclusion check can
/// run after documents are merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct XKubeCompose {
    /// Legacy registry host (`push_images: {docker_registry: HOST}`).
    pub push_images: Option<String>,
    /// New-style storage selector.
    pub cluster_image_storage: Option<ClusterImageStorage>,
    /// Base image for volume-init images.
    pub volume_init_base_image: Option<String>,
}

/// Schema version of a composition document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchemaVersion {
    /// Major version (2 or 3).
    pub major: u32,
    /// Minor version, when the document named one.
    pub minor: Option<u32>,
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}.{}", self.major, minor),
            None => write!(f, "{}", self.major),
        }
    }
}

/// One fully parsed composition document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeFile {
    /// Document path, for diagnostics.
    pub path: String,
    /// Declared schema version.
    pub version: SchemaVersion,
    /// Services by name.
    pub services: BTreeMap<String, ComposeService>,
    /// Extension block, when present.
    pub x_kube_compose: Option<XKubeCompose>,
}

/// Validates a service name: `[A-Za-z0-9._-]+` with a leading
/// alphanumeric.
pub fn validate_service_name(name: &str) -> crate::error::Result<()> {
    let mut chars = name.chars();
    let leading_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric());
    let rest_ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if leading_ok && rest_ok {
        Ok(())
    } else {
        Err(crate::error::Error::Name {
            name: name.to_string(),
            reason: "service names must match [A-Za-z0-9._-]+ and start with a letter or digit"
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_promotion_order() {
        assert!(Readiness::Started < Readiness::Healthy);
        assert_eq!(
            Readiness::Started.max(Readiness::Healthy),
            Readiness::Healthy
        );
    }

    #[test]
    fn test_service_name_validation() {
        assert!(validate_service_name("web").is_ok());
        assert!(validate_service_name("db-1.primary_x").is_ok());
        assert!(validate_service_name("9lives").is_ok());
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("!!").is_err());
        assert!(validate_service_name("-web").is_err());
        assert!(validate_service_name("we b").is_err());
    }
}
