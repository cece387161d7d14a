//! Changed-file enumeration and prior-content retrieval between refs.

use std::collections::HashSet;

use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf, RelativeUnixPathBuf};

use crate::{Error, Git, SCM};

impl SCM {
    /// Files changed between `from_ref` and `to_ref` (or the working tree
    /// when `to_ref` is `None`), anchored at `turbo_root`.
    ///
    /// Shallow clones and unknown refs surface as a recoverable
    /// `UnableToResolveRef`; the caller is expected to fall back to
    /// treating every file as changed.
    pub fn changed_files(
        &self,
        turbo_root: &AbsoluteSystemPath,
        from_ref: &str,
        to_ref: Option<&str>,
    ) -> Result<HashSet<AnchoredSystemPathBuf>, Error> {
        match self {
            SCM::Git(git) => git.changed_files(turbo_root, from_ref, to_ref),
            SCM::Manual => Err(Error::UnableToResolveRef(
                "no git repository found".to_string(),
            )),
        }
    }

    /// The contents of `file_path` as of `from_ref`.
    pub fn previous_content(
        &self,
        from_ref: &str,
        file_path: &AbsoluteSystemPath,
    ) -> Result<Vec<u8>, Error> {
        match self {
            SCM::Git(git) => git.previous_content(from_ref, file_path),
            SCM::Manual => Err(Error::UnableToResolveRef(
                "no git repository found".to_string(),
            )),
        }
    }
}

impl Git {
    fn changed_files(
        &self,
        turbo_root: &AbsoluteSystemPath,
        from_ref: &str,
        to_ref: Option<&str>,
    ) -> Result<HashSet<AnchoredSystemPathBuf>, Error> {
        self.verify_ref(from_ref)?;
        if let Some(to_ref) = to_ref {
            self.verify_ref(to_ref)?;
        }

        let range = match to_ref {
            Some(to_ref) => format!("{from_ref}...{to_ref}"),
            None => from_ref.to_string(),
        };

        let mut files = HashSet::new();
        // Committed changes in the range, then uncommitted ones on top when
        // diffing against the working tree.
        let diff = self.run(&["diff", "--name-only", "-z", &range])?;
        self.collect_changed(turbo_root, &diff, &mut files)?;
        if to_ref.is_none() {
            let status = self.run(&["ls-files", "--others", "--modified", "--exclude-standard", "-z"])?;
            self.collect_changed(turbo_root, &status, &mut files)?;
        }
        Ok(files)
    }

    /// Refs that cannot be resolved (bad name, or a merge base missing in a
    /// shallow clone) are recoverable for the caller.
    fn verify_ref(&self, git_ref: &str) -> Result<(), Error> {
        self.run(&["rev-parse", "--verify", "--quiet", git_ref])
            .map(|_| ())
            .map_err(|e| match e {
                Error::Git(msg) => Error::UnableToResolveRef(format!("{git_ref}: {msg}")),
                other => other,
            })
    }

    fn collect_changed(
        &self,
        turbo_root: &AbsoluteSystemPath,
        raw: &[u8],
        files: &mut HashSet<AnchoredSystemPathBuf>,
    ) -> Result<(), Error> {
        let raw = String::from_utf8(raw.to_vec())?;
        for file in raw.split('\0').filter(|s| !s.is_empty()) {
            // Paths are relative to the git root, which may sit above the
            // turbo root. Files outside the turbo root are not ours.
            let git_relative = RelativeUnixPathBuf::new(file)?;
            let absolute = self.root.join_unix_path(&git_relative);
            if let Ok(anchored) = turbo_root.anchor(&absolute) {
                files.insert(anchored);
            }
        }
        Ok(())
    }

    fn previous_content(
        &self,
        from_ref: &str,
        file_path: &AbsoluteSystemPath,
    ) -> Result<Vec<u8>, Error> {
        self.verify_ref(from_ref)?;
        let anchored = self.root.anchor(file_path)?;
        let spec = format!("{}:{}", from_ref, anchored.to_unix());
        self.run(&["show", &spec])
    }
}
