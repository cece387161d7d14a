use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("workspace '{0}' not found in lockfile")]
    MissingWorkspace(String),
    #[error("no lockfile entry found for '{0}'")]
    MissingPackage(String),
    #[error("missing version for non-workspace package '{0}'")]
    MissingVersion(String),
    #[error("malformed version declaration '{range}' for '{name}'")]
    MalformedRange { name: String, range: String },
    #[error("unable to parse lockfile: {0}")]
    Json(#[from] serde_json::Error),
    #[error("npm lockfiles without a 'packages' field are not supported")]
    UnsupportedNpmVersion,
}
