//! Deterministic archive creation.
//!
//! The same set of (path, contents, mode, link target) tuples must always
//! produce byte-identical archives: entries are written in caller order
//! with zeroed timestamps and ownership, and the gzip stream carries no
//! modification time.

use std::io::Write;

use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use tar::{EntryType, Header};
use turbopath::{AbsoluteSystemPath, AnchoredSystemPath};

use super::INDEX_ENTRY;
use crate::CacheError;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IndexEntry {
    pub path: String,
    pub size: u64,
    pub mode: u32,
}

pub struct CacheWriter<W: Write> {
    builder: tar::Builder<GzEncoder<W>>,
}

impl CacheWriter<std::io::BufWriter<std::fs::File>> {
    /// Creates an archive file, its parent directories included.
    pub fn create(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        path.ensure_dir()?;
        let file = path.create()?;
        Ok(Self::from_writer(std::io::BufWriter::new(file)))
    }
}

impl<W: Write> CacheWriter<W> {
    pub fn from_writer(writer: W) -> Self {
        let gz = GzEncoder::new(writer, Compression::default());
        Self {
            builder: tar::Builder::new(gz),
        }
    }

    /// Writes a complete artifact: the index entry first, then every file
    /// in the order given.
    pub fn put_files(
        &mut self,
        anchor: &AbsoluteSystemPath,
        files: &[impl AsRef<AnchoredSystemPath>],
    ) -> Result<(), CacheError> {
        let mut index = Vec::with_capacity(files.len());
        for file in files {
            let file = file.as_ref();
            let info = anchor.resolve(file).symlink_metadata()?;
            index.push(IndexEntry {
                path: file.to_unix().into_string(),
                size: if info.is_file() { info.len() } else { 0 },
                mode: unix_mode(&info),
            });
        }
        self.add_index(&index)?;
        for file in files {
            self.add_file(anchor, file.as_ref())?;
        }
        Ok(())
    }

    fn add_index(&mut self, index: &[IndexEntry]) -> Result<(), CacheError> {
        let body = serde_json::to_vec(index).map_err(CacheError::MetadataWriteFailure)?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        zero_provenance(&mut header);
        self.builder
            .append_data(&mut header, INDEX_ENTRY, body.as_slice())?;
        Ok(())
    }

    pub fn add_file(
        &mut self,
        anchor: &AbsoluteSystemPath,
        file_path: &AnchoredSystemPath,
    ) -> Result<(), CacheError> {
        let source_path = anchor.resolve(file_path);
        let info = source_path.symlink_metadata()?;

        let mut name = file_path.to_unix();
        name.make_canonical_for_tar(info.is_dir());

        let mut header = Header::new_gnu();
        header.set_mode(unix_mode(&info));
        zero_provenance(&mut header);

        if info.is_symlink() {
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            // Restored verbatim: no slash conversion on link targets.
            let target = source_path.read_link()?;
            self.builder
                .append_link(&mut header, name.as_str(), target.as_str())?;
        } else if info.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            self.builder
                .append_data(&mut header, name.as_str(), std::io::empty())?;
        } else if info.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(info.len());
            let file = source_path.open()?;
            self.builder.append_data(&mut header, name.as_str(), file)?;
        } else {
            return Err(CacheError::CreateUnsupportedFileType);
        }

        Ok(())
    }

    pub fn finish(self) -> Result<(), CacheError> {
        let gz = self.builder.into_inner()?;
        let mut writer = gz.finish()?;
        writer.flush()?;
        Ok(())
    }
}

/// Ownership is never preserved; the mode keeps only the permission bits.
fn zero_provenance(header: &mut Header) {
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
}

fn unix_mode(info: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        info.mode() & 0o777
    }
    #[cfg(not(unix))]
    {
        let _ = info;
        0o755
    }
}

#[cfg(test)]
mod tests {
    use turbopath::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

    use super::*;

    fn archive_bytes(anchor: &AbsoluteSystemPath, files: &[AnchoredSystemPathBuf]) -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut writer = CacheWriter::from_writer(&mut buffer);
        writer.put_files(anchor, files).unwrap();
        writer.finish().unwrap();
        buffer
    }

    #[test]
    fn test_archives_are_byte_identical_for_same_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let anchor =
            AbsoluteSystemPathBuf::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap();
        anchor.join_component("dist").create_dir_all().unwrap();
        anchor
            .join_components(&["dist", "main.js"])
            .create_with_contents("console.log('hi')")
            .unwrap();

        let files = vec![
            AnchoredSystemPathBuf::from_raw("dist").unwrap(),
            AnchoredSystemPathBuf::from_raw(if cfg!(windows) {
                "dist\\main.js"
            } else {
                "dist/main.js"
            })
            .unwrap(),
        ];

        let first = archive_bytes(&anchor, &files);
        let second = archive_bytes(&anchor, &files);
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn test_unsupported_file_type_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let anchor =
            AbsoluteSystemPathBuf::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap();
        let socket = anchor.join_component("server.sock");
        let _listener = std::os::unix::net::UnixListener::bind(socket.as_std_path()).unwrap();

        let mut writer = CacheWriter::from_writer(Vec::new());
        let result = writer.add_file(
            &anchor,
            AnchoredSystemPathBuf::from_raw("server.sock")
                .unwrap()
                .as_anchored_path(),
        );
        assert!(matches!(result, Err(CacheError::CreateUnsupportedFileType)));
    }
}
