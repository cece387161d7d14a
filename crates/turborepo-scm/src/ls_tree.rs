//! Parsing of `git ls-tree -r -z` output: the committed file list and
//! object ids for a subtree.
//!
//! Entry format: `<mode> <type> <oid>\t<path>\0`.

use nom::{
    bytes::complete::{tag, take, take_until},
    IResult,
};
use turbopath::RelativeUnixPathBuf;

use crate::{Error, Git, GitHashes};

impl Git {
    /// Committed hashes for every file under `pathspec` (repo-relative unix
    /// path; empty string means the whole tree) at HEAD.
    pub(crate) fn ls_tree(&self, pathspec: &str) -> Result<GitHashes, Error> {
        let mut args = vec!["ls-tree", "-r", "-z", "HEAD"];
        if !pathspec.is_empty() {
            args.push("--");
            args.push(pathspec);
        }
        let output = self.run(&args)?;
        parse_ls_tree(&output)
    }
}

struct LsTreeEntry<'a> {
    hash: &'a [u8],
    path: &'a [u8],
}

fn parse_ls_tree(output: &[u8]) -> Result<GitHashes, Error> {
    let mut hashes = GitHashes::new();
    let mut rest = output;
    while !rest.is_empty() {
        let (next, entry) = nom_entry(rest)
            .map_err(|e| Error::Parse(format!("ls-tree output: {e}")))?;
        let hash = String::from_utf8(entry.hash.to_vec())?;
        let path = RelativeUnixPathBuf::new(String::from_utf8(entry.path.to_vec())?)?;
        hashes.insert(path, hash);
        rest = next;
    }
    Ok(hashes)
}

fn nom_entry(input: &[u8]) -> IResult<&[u8], LsTreeEntry<'_>> {
    let (input, _mode) = take_until(" ")(input)?;
    let (input, _) = tag(" ")(input)?;
    let (input, _object_type) = take_until(" ")(input)?;
    let (input, _) = tag(" ")(input)?;
    let (input, hash) = take(40usize)(input)?;
    let (input, _) = tag("\t")(input)?;
    let (input, path) = take_until("\0")(input)?;
    let (input, _) = tag("\0")(input)?;
    Ok((input, LsTreeEntry { hash, path }))
}
