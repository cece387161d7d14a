//! Canonical fingerprint encoding.
//!
//! Every hashable structure serializes through the same deterministic
//! byte format: for each field, a single-byte tag, a 4-byte big-endian
//! length, then the payload. Strings are UTF-8; lists are length-prefixed
//! and must be sorted by the caller before encoding. The digest is XXH64
//! over the whole stream, rendered as 16 lowercase hex characters. Two
//! implementations that produce identical byte streams produce identical
//! fingerprints; field order in source code never leaks into the result.

use std::{collections::BTreeMap, hash::Hasher};

use turbopath::RelativeUnixPathBuf;
use turborepo_env::EnvironmentVariablePairs;
use turborepo_lockfiles::Package;

use crate::cli::EnvMode;

pub trait TurboHash {
    fn hash(&self) -> String;
}

/// Writes the tag/length/payload stream.
struct CanonicalEncoder {
    buf: Vec<u8>,
}

impl CanonicalEncoder {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn field_bytes(&mut self, tag: u8, bytes: &[u8]) {
        self.buf.push(tag);
        self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
    }

    fn field_str(&mut self, tag: u8, value: &str) {
        self.field_bytes(tag, value.as_bytes());
    }

    /// Encodes a list as a count followed by length-prefixed elements.
    /// The caller is responsible for sort order.
    fn field_str_list<S: AsRef<str>>(&mut self, tag: u8, values: &[S]) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(values.len() as u32).to_be_bytes());
        for value in values {
            let bytes = value.as_ref().as_bytes();
            payload.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            payload.extend_from_slice(bytes);
        }
        self.field_bytes(tag, &payload);
    }

    fn field_bool(&mut self, tag: u8, value: bool) {
        self.field_bytes(tag, &[u8::from(value)]);
    }

    fn field_u8(&mut self, tag: u8, value: u8) {
        self.field_bytes(tag, &[value]);
    }

    fn finish(self) -> String {
        let mut hasher = twox_hash::XxHash64::with_seed(0);
        hasher.write(&self.buf);
        hex::encode(hasher.finish().to_be_bytes())
    }
}

fn env_mode_discriminant(env_mode: EnvMode) -> u8 {
    match env_mode {
        EnvMode::Infer => 0,
        EnvMode::Loose => 1,
        EnvMode::Strict => 2,
    }
}

/// Sorted `path -> git hash` pairs for a file set.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct FileHashes(pub BTreeMap<RelativeUnixPathBuf, String>);

impl TurboHash for FileHashes {
    fn hash(&self) -> String {
        let pairs: Vec<String> = self
            .0
            .iter()
            .map(|(path, hash)| format!("{}={}", path.as_str(), hash))
            .collect();
        let mut encoder = CanonicalEncoder::new();
        encoder.field_str_list(0x01, &pairs);
        encoder.finish()
    }
}

/// The external-dependency closure of one package, hashed as a single
/// fingerprint input.
#[derive(Debug, Default)]
pub struct LockFilePackages(pub Vec<Package>);

impl TurboHash for LockFilePackages {
    fn hash(&self) -> String {
        let mut keys: Vec<String> = self
            .0
            .iter()
            .map(|package| format!("{}@{}", package.key, package.version))
            .collect();
        keys.sort();
        keys.dedup();
        let mut encoder = CanonicalEncoder::new();
        encoder.field_str_list(0x02, &keys);
        encoder.finish()
    }
}

/// The per-run fingerprint over shared inputs. Field order follows the
/// wire format, not declaration convenience.
pub struct GlobalHashable<'a> {
    pub global_cache_key: &'static str,
    pub global_file_hash_map: &'a FileHashes,
    pub root_external_deps_hash: Option<&'a str>,
    pub env: EnvironmentVariablePairs,
    pub pass_through_env: &'a [String],
    pub env_mode: EnvMode,
    pub framework_inference: bool,
    pub dot_env_hashes: &'a FileHashes,
}

impl<'a> TurboHash for GlobalHashable<'a> {
    fn hash(&self) -> String {
        let mut encoder = CanonicalEncoder::new();
        encoder.field_str(0x10, self.global_cache_key);
        encoder.field_str(0x11, &self.global_file_hash_map.hash());
        encoder.field_str(0x12, self.root_external_deps_hash.unwrap_or_default());
        encoder.field_str_list(0x13, &self.env);
        encoder.field_str_list(0x14, self.pass_through_env);
        encoder.field_u8(0x15, env_mode_discriminant(self.env_mode));
        encoder.field_bool(0x16, self.framework_inference);
        encoder.field_str(0x17, &self.dot_env_hashes.hash());
        encoder.finish()
    }
}

/// The per-task fingerprint.
pub struct TaskHashable<'a> {
    pub global_hash: &'a str,
    pub task_dependency_hashes: Vec<String>,
    pub external_deps_hash: String,
    pub hash_of_files: &'a str,
    pub task: &'a str,
    pub outputs: crate::turbo_json::TaskOutputs,
    pub pass_through_args: &'a [String],
    pub env: &'a [String],
    pub resolved_env_vars: EnvironmentVariablePairs,
    pub pass_through_env: &'a [String],
    pub env_mode: EnvMode,
    pub dot_env: &'a [RelativeUnixPathBuf],
}

impl<'a> TurboHash for TaskHashable<'a> {
    fn hash(&self) -> String {
        let mut encoder = CanonicalEncoder::new();
        encoder.field_str(0x20, self.global_hash);
        encoder.field_str_list(0x21, &self.task_dependency_hashes);
        encoder.field_str(0x22, &self.external_deps_hash);
        encoder.field_str(0x23, self.hash_of_files);
        encoder.field_str(0x24, self.task);
        encoder.field_str_list(0x25, &self.outputs.inclusions);
        encoder.field_str_list(0x26, &self.outputs.exclusions);
        encoder.field_str_list(0x27, self.pass_through_args);
        encoder.field_str_list(0x28, self.env);
        encoder.field_str_list(0x29, &self.resolved_env_vars);
        encoder.field_str_list(0x2a, self.pass_through_env);
        encoder.field_u8(0x2b, env_mode_discriminant(self.env_mode));
        encoder.field_str_list(
            0x2c,
            &self
                .dot_env
                .iter()
                .map(|path| path.as_str().to_string())
                .collect::<Vec<_>>(),
        );
        encoder.finish()
    }
}
