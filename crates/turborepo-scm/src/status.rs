//! Parsing of `git status -z` output: which files changed relative to
//! HEAD, so committed hashes can be corrected for local edits.
//!
//! Entry format: `XY <path>\0`, with a second NUL-terminated path appended
//! for renames and copies.

use nom::{
    bytes::complete::{tag, take, take_until},
    IResult,
};
use turbopath::RelativeUnixPathBuf;

use crate::{Error, Git};

#[derive(Debug, Default)]
pub(crate) struct StatusChanges {
    /// Files whose working-tree contents differ from HEAD; they must be
    /// re-hashed from disk.
    pub to_hash: Vec<RelativeUnixPathBuf>,
    /// Files deleted from the working tree; their committed hash must be
    /// dropped.
    pub to_delete: Vec<RelativeUnixPathBuf>,
}

impl Git {
    pub(crate) fn status(&self, pathspec: &str) -> Result<StatusChanges, Error> {
        let mut args = vec![
            "status",
            "-z",
            "--untracked-files=all",
            "--no-renames",
        ];
        if !pathspec.is_empty() {
            args.push("--");
            args.push(pathspec);
        }
        let output = self.run(&args)?;
        parse_status(&output)
    }
}

fn parse_status(output: &[u8]) -> Result<StatusChanges, Error> {
    let mut changes = StatusChanges::default();
    let mut rest = output;
    while !rest.is_empty() {
        let (next, (x, y, path)) =
            nom_entry(rest).map_err(|e| Error::Parse(format!("status output: {e}")))?;
        let path = RelativeUnixPathBuf::new(String::from_utf8(path.to_vec())?)?;
        if x == b'D' || y == b'D' {
            changes.to_delete.push(path);
        } else {
            changes.to_hash.push(path);
        }
        rest = next;
    }
    Ok(changes)
}

fn nom_entry(input: &[u8]) -> IResult<&[u8], (u8, u8, &[u8])> {
    let (input, status) = take(2usize)(input)?;
    let (input, _) = tag(" ")(input)?;
    let (input, path) = take_until("\0")(input)?;
    let (input, _) = tag("\0")(input)?;
    Ok((input, (status[0], status[1], path)))
}
