//! Composition model and loader.
//!
//! A composition is described by one or more YAML documents. Loading runs
//! in three stages:
//!
//! 1. [`document::parse_document`] decodes and validates each document in
//!    isolation, resolving `extends` and normalizing the multi-shape keys.
//! 2. [`merge::merge`] folds the documents, in order, with later documents
//!    overriding earlier ones.
//! 3. [`graph::Composition`] links the dependency graph and rejects
//!    cycles, unknown targets, and `healthy` requirements on services
//!    without an enabled probe.
//!
//! Documents are read through the injected [`VirtualFileSystem`], so the
//! whole loader runs against the in-memory backend in tests.

pub mod document;
pub mod graph;
pub mod merge;
pub mod types;

pub use graph::{Composition, Dependency, Service};
pub use types::{
    BindMount, ClusterImageStorage, ComposeFile, ComposeService, HealthProbe, HealthcheckSpec,
    PortBinding, Readiness, SchemaVersion, XKubeCompose,
};

use crate::constants::DEFAULT_COMPOSE_FILE;
use crate::error::{Error, Result};
use crate::vfs::VirtualFileSystem;
use std::io::Read;
use tracing::info;

/// Loads and merges composition documents into a validated composition.
///
/// When `files` is empty, the default document name is used.
pub fn load(fs: &dyn VirtualFileSystem, files: &[String]) -> Result<Composition> {
    let default = [DEFAULT_COMPOSE_FILE.to_string()];
    let paths: &[String] = if files.is_empty() { &default } else { files };
    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        let mut reader = fs.open(path).map_err(|e| match e {
            Error::NotFound(_) => Error::Parse {
                path: path.clone(),
                reason: "no such file".to_string(),
            },
            other => other,
        })?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        docs.push(document::parse_document(path, &bytes)?);
    }
    let composition = merge::merge(docs)?;
    info!(
        documents = paths.len(),
        services = composition.len(),
        "loaded composition"
    );
    Ok(composition)
}
