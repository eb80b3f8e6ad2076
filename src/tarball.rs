//! Tar materialization of bind-mount host trees.
//!
//! Walks a host path through the virtual file system and writes a tar
//! sub-tree rooted at a chosen name, reproducing host-bind-mount content
//! for a cluster that cannot mount host paths directly.
//!
//! ## Per-Entry Policy
//!
//! - **Regular file**: header then streamed content. A failed header
//!   write or a partial content copy leaves the writer *possibly corrupt*.
//! - **Directory**: a trailing-slash header first, then children in the
//!   file system's stable listing order.
//! - **Symbolic link**: the target must resolve inside the bind root
//!   (volume equality plus component-wise nesting); the emitted link-name
//!   is relative to the entry's parent within the tar tree. A target
//!   outside the root is an error.
//! - **Anything else**: an unsupported-type error.
//!
//! ## Root Error Recovery
//!
//! When the walk fails and the writer is still clean, the failed root is
//! replaced by a single empty-directory entry so a misconfigured host
//! path degrades gracefully. A possibly-corrupt writer propagates the
//! error instead; the caller must discard the stream.

use crate::error::{Error, Result};
use crate::vfs::{path, FileInfo, FileKind, VirtualFileSystem};
use std::io::{self, Read, Write};
use tar::{EntryType, Header};
use tracing::warn;

/// Copy buffer for regular-file content.
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Destination for tar entries.
///
/// The production implementation is [`ArchiveWriter`]; tests substitute a
/// recording writer to assert on the exact entry sequence.
pub trait TarWriter {
    /// Writes one entry header.
    fn write_header(&mut self, header: &Header) -> io::Result<()>;

    /// Writes entry content following the most recent header.
    fn write_data(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Ustar stream writer over any [`Write`] sink.
pub struct ArchiveWriter<W: Write> {
    inner: W,
    pad: usize,
}

impl<W: Write> ArchiveWriter<W> {
    /// Creates a writer over `inner`.
    pub fn new(inner: W) -> Self {
        Self { inner, pad: 0 }
    }

    /// Pads the final entry and writes the end-of-archive blocks,
    /// returning the underlying sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_padding()?;
        self.inner.write_all(&[0u8; 1024])?;
        Ok(self.inner)
    }

    fn flush_padding(&mut self) -> io::Result<()> {
        if self.pad > 0 {
            self.inner.write_all(&vec![0u8; self.pad])?;
            self.pad = 0;
        }
        Ok(())
    }
}

impl<W: Write> TarWriter for ArchiveWriter<W> {
    fn write_header(&mut self, header: &Header) -> io::Result<()> {
        self.flush_padding()?;
        self.inner.write_all(header.as_bytes())?;
        let size = header.entry_size()? as usize;
        self.pad = (512 - size % 512) % 512;
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)
    }
}

struct Materializer<'a> {
    fs: &'a dyn VirtualFileSystem,
    writer: &'a mut dyn TarWriter,
    may_be_corrupt: bool,
    root: &'a str,
    rename_to: &'a str,
}

impl<'a> Materializer<'a> {
    fn run(&mut self) -> Result<bool> {
        let info = self.fs.lstat(self.root)?;
        self.run_recursive(&info, self.root, self.rename_to)?;
        Ok(info.is_dir())
    }

    fn run_recursive(&mut self, info: &FileInfo, host_file: &str, name_in_tar: &str) -> Result<()> {
        match info.kind {
            FileKind::Symlink => self.run_symlink(info, host_file, name_in_tar),
            FileKind::Dir => self.run_directory(info, host_file, name_in_tar),
            FileKind::File => self.run_regular(info, host_file, name_in_tar),
            FileKind::Other => Err(Error::UnsupportedFileType(host_file.to_string())),
        }
    }

    fn run_regular(&mut self, info: &FileInfo, host_file: &str, name_in_tar: &str) -> Result<()> {
        let mut reader = self.fs.open(host_file)?;
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_size(info.size);
        header.set_mode(info.mode);
        header.set_path(name_in_tar)?;
        header.set_cksum();
        self.write_header(&header)?;
        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    self.may_be_corrupt = true;
                    return Err(err.into());
                }
            };
            if let Err(err) = self.writer.write_data(&buf[..n]) {
                self.may_be_corrupt = true;
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn run_directory(&mut self, info: &FileInfo, host_file: &str, name_in_tar: &str) -> Result<()> {
        let dir_name = format!("{name_in_tar}/");
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(info.mode);
        header.set_path(&dir_name)?;
        header.set_cksum();
        self.write_header(&header)?;
        for child in self.fs.read_dir(host_file)? {
            let child_host = format!("{host_file}/{child}");
            let child_info = self.fs.lstat(&child_host)?;
            self.run_recursive(&child_info, &child_host, &format!("{dir_name}{child}"))?;
        }
        Ok(())
    }

    fn run_symlink(&mut self, info: &FileInfo, host_file: &str, name_in_tar: &str) -> Result<()> {
        let link = self.fs.read_link(host_file)?;
        // An absolute target stands alone; a relative target is taken
        // against the link's parent directory.
        let resolved = if link.starts_with('/') {
            self.fs.abs(&link)?
        } else {
            path::join(&path::parent(host_file), &link)
        };
        if !self.is_within_bind_root(&resolved) {
            return Err(Error::SymlinkEscape {
                link: host_file.to_string(),
                target: resolved,
                root: self.root.to_string(),
            });
        }
        // Rebase the target into the tar tree, then make it relative to
        // this entry's parent.
        let target_in_tar = format!("{}{}", self.rename_to, &resolved[self.root.len()..]);
        let link_name = path::relative(&path::parent(name_in_tar), &target_in_tar);
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(info.mode);
        header.set_link_name(&link_name)?;
        header.set_path(name_in_tar)?;
        header.set_cksum();
        self.write_header(&header)
    }

    /// Containment: same volume as the root, and equal to or nested under
    /// the root's path, compared component-wise and case-sensitively.
    fn is_within_bind_root(&self, target: &str) -> bool {
        if path::volume_name(target) != path::volume_name(self.root) {
            return false;
        }
        match target.strip_prefix(self.root) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }

    fn write_header(&mut self, header: &Header) -> Result<()> {
        if let Err(err) = self.writer.write_header(header) {
            self.may_be_corrupt = true;
            return Err(err.into());
        }
        Ok(())
    }

    fn write_empty_dir_root(&mut self) -> Result<()> {
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_path(format!("{}/", self.rename_to))?;
        header.set_cksum();
        self.write_header(&header)
    }
}

/// Materializes the host tree at `host_file` into `writer`, rooted at
/// `rename_to`. Returns whether the host path was a directory.
///
/// A failure with a clean writer is recovered into a single
/// empty-directory entry (returning `is_dir = true`); a failure with a
/// possibly-corrupt writer surfaces as [`Error::TarCorrupt`].
pub fn bind_mount_host_file_to_tar(
    fs: &dyn VirtualFileSystem,
    writer: &mut dyn TarWriter,
    host_file: &str,
    rename_to: &str,
) -> Result<bool> {
    let mut materializer = Materializer {
        fs,
        writer,
        may_be_corrupt: false,
        root: host_file,
        rename_to,
    };
    match materializer.run() {
        Ok(is_dir) => Ok(is_dir),
        Err(err) => {
            if materializer.may_be_corrupt {
                return Err(Error::TarCorrupt(err.to_string()));
            }
            // Only file system failures degrade to a placeholder; policy
            // violations surface to the caller.
            if matches!(
                err,
                Error::SymlinkEscape { .. } | Error::UnsupportedFileType(_)
            ) {
                return Err(err);
            }
            warn!(
                host_file,
                error = %err,
                "cannot simulate bind volume with host file, interpreting as empty directory"
            );
            materializer.write_empty_dir_root().map_err(|write_err| {
                Error::TarCorrupt(write_err.to_string())
            })?;
            Ok(true)
        }
    }
}
