//! Manifest load/save with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::core::error::LoopError;
use crate::core::invariants::validate_invariants;
use crate::io::atomic::write_atomic;
use crate::manifest::Manifest;

pub const MANIFEST_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/manifest/v1.schema.json"
));

/// Load and validate the manifest from disk.
///
/// Any failure to read, parse or validate is reported as
/// [`LoopError::ManifestCorrupt`] inside the returned error.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let contents = fs::read_to_string(path).map_err(|err| {
        LoopError::ManifestCorrupt(format!("read {}: {err}", path.display()))
    })?;
    let manifest = parse_manifest(&contents)
        .with_context(|| format!("load manifest {}", path.display()))?;
    debug!(
        tasks = manifest.tasks.len(),
        revision = manifest.revision,
        "manifest loaded"
    );
    Ok(manifest)
}

/// Parse and validate manifest JSON.
pub fn parse_manifest(contents: &str) -> Result<Manifest, LoopError> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|err| LoopError::ManifestCorrupt(format!("invalid JSON: {err}")))?;
    validate_schema(&value)?;
    let manifest: Manifest = serde_json::from_value(value)
        .map_err(|err| LoopError::ManifestCorrupt(format!("deserialize: {err}")))?;
    let errors = validate_invariants(&manifest);
    if !errors.is_empty() {
        return Err(LoopError::ManifestCorrupt(format!(
            "invariants failed: {}",
            errors.join("; ")
        )));
    }
    Ok(manifest)
}

fn validate_schema(value: &Value) -> Result<(), LoopError> {
    let schema: Value = serde_json::from_str(MANIFEST_SCHEMA)
        .map_err(|err| LoopError::ManifestCorrupt(format!("embedded schema: {err}")))?;
    let compiled = validator_for(&schema)
        .map_err(|err| LoopError::ManifestCorrupt(format!("invalid schema: {err}")))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(LoopError::ManifestCorrupt(format!(
            "schema validation failed: {}",
            messages.join("; ")
        )));
    }
    Ok(())
}

/// Canonical on-disk bytes: pretty JSON plus trailing newline.
pub fn render_manifest(manifest: &Manifest) -> Result<String> {
    let mut buf = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
    buf.push('\n');
    Ok(buf)
}

/// Atomically write the manifest (temp file + rename).
#[instrument(skip_all, fields(path = %path.display(), revision = manifest.revision))]
pub fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    let errors = validate_invariants(manifest);
    if !errors.is_empty() {
        return Err(anyhow!(
            "refusing to write invalid manifest: {}",
            errors.join("; ")
        ));
    }
    write_atomic(path, render_manifest(manifest)?.as_bytes())
}

/// sha256 of the manifest file, or `None` if it does not exist.
pub fn fingerprint_file(path: &Path) -> Result<Option<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(fingerprint(&bytes))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
