//! Volume-init image pipeline.
//!
//! Reproduces host bind mounts on a cluster that cannot mount host paths:
//! each bind path is materialized as a `data{i}` sub-tree of a tar build
//! context, a deterministic Dockerfile copies the sub-trees into
//! `/app/data/vol{i}`, and the resulting image's entrypoint copies them
//! into `/mnt/vol{i}/root` at pod start. The per-path directory flags are
//! reported back so volume mounts can be declared appropriately.

use crate::build::{BuildOptions, ImageBuilder};
use crate::constants::DEFAULT_BASE_IMAGE;
use crate::error::Result;
use crate::tarball::{bind_mount_host_file_to_tar, ArchiveWriter, TarWriter};
use crate::vfs::VirtualFileSystem;
use std::collections::BTreeMap;
use tar::{EntryType, Header};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Generates the volume-init Dockerfile for the given directory flags.
///
/// `COPY` sources and destinations carry a trailing slash exactly when the
/// corresponding host path is a directory.
pub fn volume_init_dockerfile(is_dir_flags: &[bool]) -> Vec<u8> {
    let mut out = String::from("ARG BASE_IMAGE\nFROM ${BASE_IMAGE}\n");
    for (idx, is_dir) in is_dir_flags.iter().enumerate() {
        let i = idx + 1;
        if *is_dir {
            out.push_str(&format!("COPY data{i}/ /app/data/vol{i}/\n"));
        } else {
            out.push_str(&format!("COPY data{i} /app/data/vol{i}\n"));
        }
    }
    out.push_str("ENTRYPOINT [\"bash\", \"-c\", \"");
    for idx in 0..is_dir_flags.len() {
        let i = idx + 1;
        if idx > 0 {
            out.push_str(" && ");
        }
        out.push_str(&format!("cp -r /app/data/vol{i} /mnt/vol{i}/root"));
    }
    out.push_str("\"]\n");
    out.into_bytes()
}

/// A fully assembled build context for one service's volume-init image.
#[derive(Debug)]
pub struct BuildContext {
    /// The tar stream: `data1`…`dataN` sub-trees followed by the
    /// Dockerfile.
    pub tar: Vec<u8>,
    /// Whether each host path resolved to a directory, parallel to the
    /// input path list.
    pub is_dir: Vec<bool>,
}

/// Materializes the bind host paths into a tar build context.
pub fn assemble_build_context(
    fs: &dyn VirtualFileSystem,
    bind_volume_host_paths: &[String],
) -> Result<BuildContext> {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::new(&mut buf);
    let mut is_dir = Vec::with_capacity(bind_volume_host_paths.len());
    for (idx, host_path) in bind_volume_host_paths.iter().enumerate() {
        let entry_is_dir =
            bind_mount_host_file_to_tar(fs, &mut writer, host_path, &format!("data{}", idx + 1))?;
        is_dir.push(entry_is_dir);
    }

    let dockerfile = volume_init_dockerfile(&is_dir);
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_path("Dockerfile")?;
    header.set_cksum();
    writer.write_header(&header)?;
    writer.write_data(&dockerfile)?;
    writer.finish()?;
    Ok(BuildContext { tar: buf, is_dir })
}

/// Result of building one volume-init image.
#[derive(Debug, Clone)]
pub struct VolumeInitImage {
    /// `sha256:`-prefixed image ID.
    pub image_id: String,
    /// Directory flag per bind path, in input order.
    pub is_dir: Vec<bool>,
}

/// Builds the volume-init image for a service's bind host paths.
///
/// `base_image` defaults to `ubuntu:latest` when `None`; the build runs
/// with suppressed output so only the image ID appears in the progress
/// stream.
pub async fn build_volume_init_image(
    fs: &dyn VirtualFileSystem,
    builder: &dyn ImageBuilder,
    bind_volume_host_paths: &[String],
    base_image: Option<&str>,
    cancel: &CancellationToken,
) -> Result<VolumeInitImage> {
    let context = assemble_build_context(fs, bind_volume_host_paths)?;
    let options = BuildOptions {
        build_args: BTreeMap::from([(
            "BASE_IMAGE".to_string(),
            base_image.unwrap_or(DEFAULT_BASE_IMAGE).to_string(),
        )]),
        suppress_output: true,
        remove_intermediate: true,
    };
    let image_id = builder.build(&context.tar, &options, cancel).await?;
    info!(
        %image_id,
        paths = bind_volume_host_paths.len(),
        "built volume-init image"
    );
    Ok(VolumeInitImage {
        image_id,
        is_dir: context.is_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dockerfile_mixed_flags() {
        let actual = volume_init_dockerfile(&[true, false]);
        let expected = "ARG BASE_IMAGE\n\
                        FROM ${BASE_IMAGE}\n\
                        COPY data1/ /app/data/vol1/\n\
                        COPY data2 /app/data/vol2\n\
                        ENTRYPOINT [\"bash\", \"-c\", \"cp -r /app/data/vol1 /mnt/vol1/root && cp -r /app/data/vol2 /mnt/vol2/root\"]\n";
        assert_eq!(String::from_utf8(actual).unwrap(), expected);
    }

    #[test]
    fn test_dockerfile_no_paths() {
        let actual = volume_init_dockerfile(&[]);
        let expected = "ARG BASE_IMAGE\nFROM ${BASE_IMAGE}\nENTRYPOINT [\"bash\", \"-c\", \"\"]\n";
        assert_eq!(String::from_utf8(actual).unwrap(), expected);
    }
}
