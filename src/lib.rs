//! # komposer
//!
//! **Compose-to-cluster bring-up.**
//!
//! Translates a multi-service docker-compose composition into a running
//! deployment on a Kubernetes-style cluster, bringing services up in an
//! order that satisfies the `depends_on` and health-readiness constraints
//! declared in the composition.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            komposer                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  documents ──► compose::document ──► compose::merge ──► graph    │
//! │                                                          │       │
//! │  per bind path:  resolve ──► tarball ──► volume ──► build│       │
//! │                     │           │                    │   ▼       │
//! │                     └───────────┴── vfs ──┐     orchestrate      │
//! │                                           │          │           │
//! │  InMemoryFileSystem (tests)               │     ClusterClient    │
//! │  HostFileSystem (production) ─────────────┘     ImageBuilder     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The loader parses and validates each document, merges them with
//! well-defined override semantics, and links the dependency DAG. Bind
//! mounts cannot be reproduced directly on the cluster, so each service's
//! host paths are canonicalized, materialized into a tar build context,
//! and baked into a volume-init image whose entrypoint copies the data
//! into cluster-side mount points. The orchestrator then creates pods and
//! services in dependency order, waiting on `started`/`healthy` readiness
//! between layers.
//!
//! Everything that touches the file system goes through the
//! [`vfs::VirtualFileSystem`] trait, so the whole pipeline below the
//! external seams runs deterministically against an in-memory tree in
//! tests, including injected read faults.
//!
//! # External Seams
//!
//! - [`build::ImageBuilder`] — the external image build service; the
//!   shipped implementation drives the `docker` CLI.
//! - [`cluster::ClusterClient`] — pod/service creation and readiness;
//!   the shipped implementation drives `kubectl`.
//!
//! Both seams accept a cancellation token; cancellation closes in-flight
//! reads and surfaces as a distinguished error.
//!
//! # Example
//!
//! ```rust,ignore
//! use komposer::{
//!     build::DockerCliBuilder, cluster::KubectlClusterClient, compose,
//!     orchestrate::UpOptions, vfs::HostFileSystem,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> komposer::Result<()> {
//!     let fs = HostFileSystem::new();
//!     let composition = compose::load(&fs, &["docker-compose.yml".to_string()])?;
//!     komposer::up::up(
//!         &fs,
//!         &composition,
//!         &DockerCliBuilder::default(),
//!         Arc::new(KubectlClusterClient::default()),
//!         UpOptions::default(),
//!         CancellationToken::new(),
//!     )
//!     .await
//! }
//! ```

pub mod build;
pub mod cluster;
pub mod compose;
mod constants;
mod error;
pub mod orchestrate;
pub mod resolve;
pub mod tarball;
pub mod up;
pub mod vfs;
pub mod volume;

pub use constants::DEFAULT_BASE_IMAGE;
pub use error::{Error, Result};
