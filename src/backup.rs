//! Workspace bundle: a zip with the leveling database and a manifest naming
//! the cycles that were still open when it was taken.

use crate::db::DB_FILE_NAME;
use crate::leveling::LevelTest;
use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const BUNDLE_FORMAT: &str = "leveling-workspace-v1";
const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/leveling.sqlite3";

/// Enough of a cycle to tell which grades were mid-placement at export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenCycle {
    pub id: String,
    pub grade: i64,
    pub academic_year: String,
    pub semester: i64,
    pub status: String,
}

impl From<&LevelTest> for OpenCycle {
    fn from(t: &LevelTest) -> Self {
        Self {
            id: t.id.clone(),
            grade: t.grade,
            academic_year: t.academic_year.clone(),
            semester: t.semester,
            status: t.status.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub format: String,
    pub app_version: String,
    pub exported_at: String,
    pub db_sha256: String,
    #[serde(default)]
    pub open_level_tests: Vec<OpenCycle>,
}

/// A bundle that passed format and checksum checks, held in memory until
/// it is restored.
pub struct VerifiedBundle {
    pub manifest: BundleManifest,
    db_bytes: Vec<u8>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn write_entry<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    bytes: &[u8],
) -> anyhow::Result<()> {
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start bundle entry {}", name))?;
    zip.write_all(bytes)
        .with_context(|| format!("failed to write bundle entry {}", name))?;
    Ok(())
}

pub fn export_bundle(
    workspace: &Path,
    out_path: &Path,
    open_level_tests: Vec<OpenCycle>,
) -> anyhow::Result<BundleManifest> {
    let db_path = workspace.join(DB_FILE_NAME);
    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.display()))?;
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let manifest = BundleManifest {
        format: BUNDLE_FORMAT.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        db_sha256: sha256_hex(&db_bytes),
        open_level_tests,
    };
    let out = File::create(out_path)
        .with_context(|| format!("failed to create bundle {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out);
    write_entry(
        &mut zip,
        MANIFEST_ENTRY,
        &serde_json::to_vec_pretty(&manifest).context("failed to serialize manifest")?,
    )?;
    write_entry(&mut zip, DB_ENTRY, &db_bytes)?;
    zip.finish().context("failed to finalize bundle")?;
    Ok(manifest)
}

/// Reads a bundle fully and checks it without touching any workspace.
pub fn read_bundle(in_path: &Path) -> anyhow::Result<VerifiedBundle> {
    let f = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(f).context("bundle is not a zip archive")?;

    let manifest: BundleManifest = {
        let entry = archive
            .by_name(MANIFEST_ENTRY)
            .context("bundle has no manifest.json")?;
        serde_json::from_reader(entry).context("manifest.json is invalid")?
    };
    if manifest.format != BUNDLE_FORMAT {
        bail!("unsupported bundle format: {}", manifest.format);
    }

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .with_context(|| format!("bundle has no {}", DB_ENTRY))?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database")?;
    let actual = sha256_hex(&db_bytes);
    if !actual.eq_ignore_ascii_case(&manifest.db_sha256) {
        return Err(anyhow!(
            "database checksum mismatch: manifest {}, bundle {}",
            manifest.db_sha256,
            actual
        ));
    }
    Ok(VerifiedBundle { manifest, db_bytes })
}

impl VerifiedBundle {
    /// Replaces the workspace database. The new file is written beside the
    /// old one and renamed over it.
    pub fn restore_into(&self, workspace: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(workspace)
            .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
        let dst = workspace.join(DB_FILE_NAME);
        let staged = workspace.join(format!("{}.restoring", DB_FILE_NAME));
        std::fs::write(&staged, &self.db_bytes)
            .with_context(|| format!("failed to stage database {}", staged.display()))?;
        std::fs::rename(&staged, &dst)
            .with_context(|| format!("failed to move restored database to {}", dst.display()))?;
        Ok(())
    }
}
