//! Git-compatible blob hashing without a git subprocess.
//!
//! A blob's object id is `sha1("blob <len>\0" + contents)`, which lets the
//! manual walker and the git-index reader produce interchangeable hashes.

use std::io::Read;

use sha1::{Digest, Sha1};
use turbopath::{AbsoluteSystemPath, RelativeUnixPathBuf};

use crate::{Error, GitHashes};

pub(crate) fn hash_object(contents: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", contents.len()).as_bytes());
    hasher.update(contents);
    hex::encode(hasher.finalize())
}

pub(crate) fn hash_file(path: &AbsoluteSystemPath) -> Result<String, Error> {
    // Symlinks are hashed by their target path, matching how git stores
    // them in the index.
    let metadata = path.symlink_metadata()?;
    if metadata.is_symlink() {
        let target = path.read_link()?;
        return Ok(hash_object(target.as_str().as_bytes()));
    }
    let mut file = path.open()?;
    let mut contents = Vec::with_capacity(metadata.len() as usize);
    file.read_to_end(&mut contents)?;
    Ok(hash_object(&contents))
}

/// Hashes the given repo-anchored files into `hashes`, keyed relative to
/// the package. Files that do not exist are skipped, not errors.
pub(crate) fn hash_files(
    repo_root: &AbsoluteSystemPath,
    files: impl IntoIterator<Item = RelativeUnixPathBuf>,
    hashes: &mut GitHashes,
) -> Result<(), Error> {
    for file in files {
        let full_path = repo_root.join_unix_path(&file);
        match full_path.symlink_metadata() {
            Ok(_) => {
                hashes.insert(file, hash_file(&full_path)?);
            }
            Err(e) if e.is_io_error(std::io::ErrorKind::NotFound) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
