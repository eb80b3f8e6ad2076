//! External image build service interface.
//!
//! The pipeline never builds images itself; it hands a tar build context
//! to an [`ImageBuilder`] and records the resulting image ID. Two pieces
//! live here:
//!
//! - [`image_id_from_progress`]: scans a daemon-style newline-delimited
//!   JSON progress stream for the first sha-256 image digest. Kept narrow
//!   on purpose; a message that fails to decode surfaces the raw line for
//!   diagnosis.
//! - [`DockerCliBuilder`]: drives `docker build --quiet` with the context
//!   on stdin, the corpus pattern for delegating to an external engine.

use crate::constants::{SHA256_HEX_LEN, SHA256_PREFIX};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Options for one image build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// `--build-arg` bindings, sorted by name.
    pub build_args: BTreeMap<String, String>,
    /// Suppress layer-by-layer output so only the image ID is reported.
    pub suppress_output: bool,
    /// Remove intermediate containers after a successful build.
    pub remove_intermediate: bool,
}

/// An external service that turns a tar build context into an image.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds an image and returns its `sha256:`-prefixed ID.
    async fn build(
        &self,
        context: &[u8],
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Finds the first `sha256:` digest (64 lowercase hex digits) in `text`.
pub fn find_sha256_digest(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find(SHA256_PREFIX) {
        let begin = search_from + pos;
        let hex_start = begin + SHA256_PREFIX.len();
        let hex_end = hex_start + SHA256_HEX_LEN;
        if hex_end <= bytes.len()
            && bytes[hex_start..hex_end]
                .iter()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Some(&text[begin..hex_end]);
        }
        search_from = hex_start;
    }
    None
}

/// One message of the build service's progress stream.
#[derive(Debug, Default, Deserialize)]
struct BuildMessage {
    #[serde(default)]
    stream: String,
    #[serde(default)]
    error: Option<String>,
}

/// Scans a newline-delimited JSON progress stream for the built image's
/// ID.
///
/// The first digest seen wins. A message carrying an `error` field aborts
/// the scan; a stream that ends without any digest fails with
/// [`Error::BuildNoImageId`]. Cancellation closes the read promptly.
pub async fn image_id_from_progress<R>(stream: R, cancel: &CancellationToken) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = stream.lines();
    let mut image_id: Option<String> = None;
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let msg: BuildMessage = serde_json::from_str(&line)
            .map_err(|e| Error::Build(format!("malformed progress message {line:?}: {e}")))?;
        if let Some(error) = msg.error {
            return Err(Error::Build(error));
        }
        if image_id.is_none() {
            if let Some(digest) = find_sha256_digest(&msg.stream) {
                debug!(digest, "found image ID in build stream");
                image_id = Some(digest.to_string());
            }
        }
    }
    image_id.ok_or(Error::BuildNoImageId)
}

/// [`ImageBuilder`] backed by the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerCliBuilder {
    program: String,
}

impl Default for DockerCliBuilder {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCliBuilder {
    /// Creates a builder that invokes `program`.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

#[async_trait]
impl ImageBuilder for DockerCliBuilder {
    async fn build(
        &self,
        context: &[u8],
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg("build");
        if options.suppress_output {
            cmd.arg("--quiet");
        }
        if options.remove_intermediate {
            cmd.arg("--rm");
        }
        for (name, value) in &options.build_args {
            cmd.arg("--build-arg").arg(format!("{name}={value}"));
        }
        // Read the build context from stdin.
        cmd.arg("-");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| Error::Subprocess {
            command: format!("{} build", self.program),
            reason: e.to_string(),
        })?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(context).await?;
        drop(stdin);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            output = child.wait_with_output() => output?,
        };
        if !output.status.success() {
            return Err(Error::Subprocess {
                command: format!("{} build", self.program),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let digest = find_sha256_digest(&stdout).ok_or(Error::BuildNoImageId)?;
        info!(image_id = digest, "built image");
        Ok(digest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn test_find_digest() {
        assert_eq!(find_sha256_digest(DIGEST), Some(DIGEST));
        assert_eq!(
            find_sha256_digest(&format!("Successfully built {DIGEST}\n")),
            Some(DIGEST)
        );
        assert_eq!(find_sha256_digest("sha256:deadbeef"), None);
        assert_eq!(find_sha256_digest("no digest here"), None);
        // Uppercase hex is not a digest.
        let upper = format!("sha256:{}", "A".repeat(64));
        assert_eq!(find_sha256_digest(&upper), None);
    }

    #[test]
    fn test_find_digest_skips_short_candidates() {
        let text = format!("sha256:123 then {DIGEST}");
        assert_eq!(find_sha256_digest(&text), Some(DIGEST));
    }

    #[tokio::test]
    async fn test_image_id_from_progress() {
        let stream = format!(
            "{}\n{}\n",
            r#"{"stream":"Step 1/3 : ARG BASE_IMAGE"}"#,
            format!(r#"{{"stream":"{DIGEST}\n"}}"#)
        );
        let cancel = CancellationToken::new();
        let id = image_id_from_progress(stream.as_bytes(), &cancel)
            .await
            .unwrap();
        assert_eq!(id, DIGEST);
    }

    #[tokio::test]
    async fn test_image_id_missing_fails() {
        let stream = "{\"stream\":\"Step 1/3\"}\n";
        let cancel = CancellationToken::new();
        assert!(matches!(
            image_id_from_progress(stream.as_bytes(), &cancel).await,
            Err(Error::BuildNoImageId)
        ));
    }

    #[tokio::test]
    async fn test_stream_error_aborts() {
        let stream = "{\"error\":\"frontend failed\"}\n";
        let cancel = CancellationToken::new();
        assert!(matches!(
            image_id_from_progress(stream.as_bytes(), &cancel).await,
            Err(Error::Build(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_scan() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = format!("{{\"stream\":\"{DIGEST}\"}}\n");
        assert!(matches!(
            image_id_from_progress(stream.as_bytes(), &cancel).await,
            Err(Error::Cancelled)
        ));
    }
}
