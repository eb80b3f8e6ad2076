//! One-shot bring-up pipeline.
//!
//! Ties the stages together for the `up` command: resolve each selected
//! service's bind-mount host paths, build its volume-init image, then hand
//! the composition and the per-service images to the orchestrator.

use crate::build::ImageBuilder;
use crate::cluster::ClusterClient;
use crate::compose::Composition;
use crate::error::Result;
use crate::orchestrate::{bring_up, UpOptions};
use crate::resolve::resolve_bind_volume_host_path;
use crate::vfs::VirtualFileSystem;
use crate::volume::{build_volume_init_image, VolumeInitImage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Deploys the selected services of a loaded composition.
pub async fn up(
    fs: &dyn VirtualFileSystem,
    composition: &Composition,
    builder: &dyn ImageBuilder,
    client: Arc<dyn ClusterClient>,
    options: UpOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let mut volume_images: HashMap<String, VolumeInitImage> = HashMap::new();
    for idx in composition.selected() {
        let service = composition.service(idx);
        if service.compose.volumes.is_empty() {
            continue;
        }
        let mut host_paths = Vec::with_capacity(service.compose.volumes.len());
        for bind in &service.compose.volumes {
            let resolved = resolve_bind_volume_host_path(fs, &bind.host_path)?;
            debug!(
                service = %service.name,
                host_path = %bind.host_path,
                %resolved,
                "resolved bind-mount host path"
            );
            host_paths.push(resolved);
        }
        let image = build_volume_init_image(
            fs,
            builder,
            &host_paths,
            composition.volume_init_base_image.as_deref(),
            &cancel,
        )
        .await?;
        volume_images.insert(service.name.clone(), image);
    }
    bring_up(composition, &volume_images, client, options, cancel).await
}
