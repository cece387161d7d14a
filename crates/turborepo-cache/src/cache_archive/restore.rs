//! Artifact restoration.
//!
//! Regular files and directories are restored in archive order. Symlinks
//! are collected and restored afterwards in topological order of their
//! (lexically canonicalized) targets, so a link is never created before
//! the entry it points at; a cycle among symlink entries is a decode
//! error. Entry names that escape the anchor are rejected.

use std::{
    collections::HashMap,
    io::Read,
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use path_clean::PathClean;
use petgraph::graph::DiGraph;
use tar::Archive;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use super::{create::IndexEntry, INDEX_ENTRY};
use crate::CacheError;

pub struct CacheReader<R: Read> {
    reader: R,
}

impl CacheReader<std::io::BufReader<std::fs::File>> {
    pub fn open(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let file = path.open()?;
        Ok(Self::from_reader(std::io::BufReader::new(file)))
    }
}

impl<R: Read> CacheReader<R> {
    pub fn from_reader(reader: R) -> Self {
        Self { reader }
    }

    /// Reads only the index entry, listing the artifact's contents without
    /// extracting anything.
    pub fn list(self) -> Result<Vec<(AnchoredSystemPathBuf, u64, u32)>, CacheError> {
        let gz = GzDecoder::new(self.reader);
        let mut archive = Archive::new(gz);
        let mut entries = archive.entries()?;
        let Some(first) = entries.next() else {
            return Err(CacheError::MissingIndex);
        };
        let mut first = first?;
        if first.header().path()?.as_ref() != Path::new(INDEX_ENTRY) {
            return Err(CacheError::MissingIndex);
        }
        let mut body = Vec::new();
        first.read_to_end(&mut body)?;
        let index: Vec<IndexEntry> =
            serde_json::from_slice(&body).map_err(CacheError::InvalidMetadata)?;
        index
            .into_iter()
            .map(|entry| {
                let path = turbopath::RelativeUnixPathBuf::new(entry.path)
                    .map_err(CacheError::Path)?
                    .to_anchored_system_path_buf();
                Ok((path, entry.size, entry.mode))
            })
            .collect()
    }

    /// Unpacks the archive under `anchor`, returning every restored path.
    pub fn restore(
        self,
        anchor: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        anchor.create_dir_all()?;
        let gz = GzDecoder::new(self.reader);
        let mut archive = Archive::new(gz);

        let mut restored = Vec::new();
        let mut symlinks: Vec<(AnchoredSystemPathBuf, PathBuf, u32)> = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let header = entry.header();
            let name = canonicalize_name(&header.path()?)?;
            if name.as_str() == INDEX_ENTRY {
                continue;
            }

            match header.entry_type() {
                tar::EntryType::Directory => {
                    safe_mkdir_all(anchor, &name, header.mode()?)?;
                    restored.push(name);
                }
                tar::EntryType::Regular => {
                    let mode = header.mode()?;
                    restore_regular(anchor, &name, &mut entry, mode)?;
                    restored.push(name);
                }
                tar::EntryType::Symlink => {
                    let target = header
                        .link_name()?
                        .ok_or(CacheError::LinkTargetNotOnHeader)?
                        .into_owned();
                    symlinks.push((name, target, header.mode()?));
                }
                ty => return Err(CacheError::RestoreUnsupportedFileType(ty)),
            }
        }

        restored.extend(restore_symlinks_in_topological_order(anchor, symlinks)?);
        Ok(restored)
    }
}

fn restore_regular(
    anchor: &AbsoluteSystemPath,
    name: &AnchoredSystemPathBuf,
    entry: &mut impl Read,
    mode: u32,
) -> Result<(), CacheError> {
    ensure_parent_dirs(anchor, name)?;
    let resolved = anchor.resolve(name);
    let mut options = std::fs::OpenOptions::new();
    options.write(true).truncate(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = resolved.open_with_options(&options)?;
    std::io::copy(entry, &mut file)?;
    Ok(())
}

/// Restores the collected symlinks so that targets exist before linkers.
/// The ordering graph is keyed by the lexically canonical path each entry
/// occupies or points at.
fn restore_symlinks_in_topological_order(
    anchor: &AbsoluteSystemPath,
    symlinks: Vec<(AnchoredSystemPathBuf, PathBuf, u32)>,
) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    let mut entries: HashMap<PathBuf, (AnchoredSystemPathBuf, PathBuf)> = HashMap::new();

    for (name, target, _mode) in &symlinks {
        let source_key = canonicalize_linkname(anchor, name, name.as_str().as_ref());
        let target_key = canonicalize_linkname(anchor, name, target);

        let source_node = *nodes
            .entry(source_key.clone())
            .or_insert_with(|| graph.add_node(source_key.clone()));
        let target_node = *nodes
            .entry(target_key.clone())
            .or_insert_with(|| graph.add_node(target_key.clone()));
        // The target must be restored before the source.
        graph.add_edge(target_node, source_node, ());

        entries.insert(source_key, (name.clone(), target.clone()));
    }

    let order =
        petgraph::algo::toposort(&graph, None).map_err(|_| CacheError::CycleDetected)?;

    let mut restored = Vec::new();
    for node in order {
        let Some((name, target)) = entries.get(&graph[node]) else {
            // Target of a link that is not itself a symlink entry.
            continue;
        };
        ensure_parent_dirs(anchor, name)?;
        let location = anchor.resolve(name);
        if location.symlink_metadata().is_ok() {
            location.remove_file()?;
        }
        // Targets are restored verbatim; no separator conversion.
        let target_str = target
            .to_str()
            .ok_or_else(|| CacheError::InvalidFilePath(target.to_string_lossy().into_owned()))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(target_str, location.as_std_path())?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_file(target_str, location.as_std_path())?;
        restored.push(name.clone());
    }

    Ok(restored)
}

/// Validates an archive entry name: relative, no traversal, UTF-8.
fn canonicalize_name(name: &Path) -> Result<AnchoredSystemPathBuf, CacheError> {
    let cleaned = name.clean();
    if cleaned.is_absolute()
        || cleaned
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(CacheError::InvalidFilePath(
            name.to_string_lossy().into_owned(),
        ));
    }
    let utf8 = cleaned
        .to_str()
        .ok_or_else(|| CacheError::InvalidFilePath(name.to_string_lossy().into_owned()))?;
    // Entry names in our archives are unix-style.
    Ok(turbopath::RelativeUnixPathBuf::new(utf8.trim_end_matches('/'))
        .map_err(CacheError::Path)?
        .to_anchored_system_path_buf())
}

/// Where `linkname`, written at `source`, lexically resolves on this
/// system. Used only to order restoration; the link itself is written
/// verbatim.
fn canonicalize_linkname(
    anchor: &AbsoluteSystemPath,
    source: &AnchoredSystemPathBuf,
    linkname: &Path,
) -> PathBuf {
    let cleaned = linkname.clean();
    if cleaned.is_absolute() {
        return cleaned;
    }
    let source_location = anchor.resolve(source);
    let base: &Path = source_location
        .parent()
        .map(|p| p.as_std_path())
        .unwrap_or_else(|| anchor.as_std_path());
    base.join(cleaned).clean()
}

fn ensure_parent_dirs(
    anchor: &AbsoluteSystemPath,
    name: &AnchoredSystemPathBuf,
) -> Result<(), CacheError> {
    if let Some(parent) = name.parent() {
        if !parent.as_str().is_empty() {
            safe_mkdir_all(anchor, &parent.to_owned(), 0o755)?;
        }
    }
    Ok(())
}

/// Creates a directory chain under the anchor, refusing to follow any
/// existing symlink that escapes it.
fn safe_mkdir_all(
    anchor: &AbsoluteSystemPath,
    name: &AnchoredSystemPathBuf,
    mode: u32,
) -> Result<(), CacheError> {
    let mut current = anchor.to_owned();
    for component in name.components() {
        current.push(component.as_str());
        if let Ok(info) = current.symlink_metadata() {
            if info.is_symlink() {
                let resolved = current
                    .read_link()
                    .ok()
                    .map(|target| {
                        if target.is_absolute() {
                            PathBuf::from(target.as_str())
                        } else {
                            current
                                .parent()
                                .map(|p| p.as_std_path().join(target.as_std_path()))
                                .unwrap_or_else(|| target.into_std_path_buf())
                        }
                    })
                    .map(|p| p.clean());
                let escapes = resolved.map_or(true, |resolved| {
                    !resolved.starts_with(anchor.as_std_path())
                });
                if escapes {
                    return Err(CacheError::InvalidFilePath(name.to_string()));
                }
            }
        }
    }

    let resolved = anchor.resolve(name);
    std::fs::create_dir_all(&resolved)?;
    #[cfg(unix)]
    resolved.set_unix_mode(mode & 0o777)?;
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

#[cfg(test)]
mod tests {
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::cache_archive::CacheWriter;

    fn tmp_anchor(tmp: &tempfile::TempDir) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap()
    }

    fn anchored(path: &str) -> AnchoredSystemPathBuf {
        turbopath::RelativeUnixPathBuf::new(path)
            .unwrap()
            .to_anchored_system_path_buf()
    }

    fn round_trip(
        input_anchor: &AbsoluteSystemPath,
        files: &[AnchoredSystemPathBuf],
    ) -> (tempfile::TempDir, Vec<AnchoredSystemPathBuf>) {
        let mut buffer = Vec::new();
        let mut writer = CacheWriter::from_writer(&mut buffer);
        writer.put_files(input_anchor, files).unwrap();
        writer.finish().unwrap();

        let output = tempfile::tempdir().unwrap();
        let output_anchor = tmp_anchor(&output);
        let restored = CacheReader::from_reader(buffer.as_slice())
            .restore(&output_anchor)
            .unwrap();
        (output, restored)
    }

    #[test]
    fn test_round_trip_preserves_contents_and_links() {
        let input = tempfile::tempdir().unwrap();
        let anchor = tmp_anchor(&input);
        anchor.join_component("dist").create_dir_all().unwrap();
        anchor
            .join_components(&["dist", "main.js"])
            .create_with_contents("console.log('hi')")
            .unwrap();
        anchor
            .join_component("latest")
            .symlink_to_file("dist/main.js")
            .unwrap();

        let files = vec![anchored("dist"), anchored("dist/main.js"), anchored("latest")];
        let (output, restored) = round_trip(&anchor, &files);
        let output_anchor = tmp_anchor(&output);

        assert_eq!(restored.len(), 3);
        assert_eq!(
            output_anchor
                .join_components(&["dist", "main.js"])
                .read_to_string()
                .unwrap(),
            "console.log('hi')"
        );
        let link = output_anchor.join_component("latest");
        assert!(link.symlink_metadata().unwrap().is_symlink());
        assert_eq!(link.read_link().unwrap().as_str(), "dist/main.js");
    }

    #[cfg(unix)]
    #[test]
    fn test_round_trip_preserves_mode() {
        let input = tempfile::tempdir().unwrap();
        let anchor = tmp_anchor(&input);
        let script = anchor.join_component("run.sh");
        script.create_with_contents("#!/bin/sh\n").unwrap();
        script.set_unix_mode(0o755).unwrap();

        let (output, _) = round_trip(&anchor, &[anchored("run.sh")]);
        let output_anchor = tmp_anchor(&output);
        use std::os::unix::fs::MetadataExt;
        let mode = output_anchor
            .join_component("run.sh")
            .symlink_metadata()
            .unwrap()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_chained_symlinks_restore_in_order() {
        let input = tempfile::tempdir().unwrap();
        let anchor = tmp_anchor(&input);
        anchor
            .join_component("real.txt")
            .create_with_contents("data")
            .unwrap();
        anchor
            .join_component("one")
            .symlink_to_file("real.txt")
            .unwrap();
        anchor.join_component("two").symlink_to_file("one").unwrap();

        // Intentionally list the dependent link before its target.
        let files = vec![anchored("real.txt"), anchored("two"), anchored("one")];
        let (output, _) = round_trip(&anchor, &files);
        let output_anchor = tmp_anchor(&output);
        assert_eq!(
            output_anchor
                .join_component("two")
                .read_to_string()
                .unwrap(),
            "data"
        );
    }

    #[test]
    fn test_symlink_cycle_is_fatal() {
        // Hand-build an archive containing a -> b -> a.
        let mut tar_bytes = Vec::new();
        {
            let gz = flate2::write::GzEncoder::new(&mut tar_bytes, flate2::Compression::default());
            let mut builder = tar::Builder::new(gz);
            for (name, target) in [("a", "b"), ("b", "a")] {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                builder.append_link(&mut header, name, target).unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
        }

        let output = tempfile::tempdir().unwrap();
        let output_anchor = tmp_anchor(&output);
        let result = CacheReader::from_reader(tar_bytes.as_slice()).restore(&output_anchor);
        assert!(matches!(result, Err(CacheError::CycleDetected)));
    }

    #[test]
    fn test_entry_escaping_anchor_is_rejected() {
        let mut tar_bytes = Vec::new();
        {
            let gz = flate2::write::GzEncoder::new(&mut tar_bytes, flate2::Compression::default());
            let mut builder = tar::Builder::new(gz);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(4);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, "../escape.txt", "oops".as_bytes())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let output = tempfile::tempdir().unwrap();
        let output_anchor = tmp_anchor(&output);
        let result = CacheReader::from_reader(tar_bytes.as_slice()).restore(&output_anchor);
        assert!(matches!(result, Err(CacheError::InvalidFilePath(_))));
    }

    #[test]
    fn test_list_reads_only_the_index() {
        let input = tempfile::tempdir().unwrap();
        let anchor = tmp_anchor(&input);
        anchor
            .join_component("out.txt")
            .create_with_contents("12345")
            .unwrap();

        let mut buffer = Vec::new();
        let mut writer = CacheWriter::from_writer(&mut buffer);
        writer.put_files(&anchor, &[anchored("out.txt")]).unwrap();
        writer.finish().unwrap();

        let listing = CacheReader::from_reader(buffer.as_slice()).list().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].0, anchored("out.txt"));
        assert_eq!(listing[0].1, 5);
    }
}
