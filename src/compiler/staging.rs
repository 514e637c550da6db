//! On-disk staging archive for compiled units.
//!
//! Layout: a zip with a `MANIFEST` entry (JSON [`Manifest`]) and one
//! `units/<index>` entry per unit blob. The archive is named `<uuid>.zip` so
//! concurrent compilers sharing a staging directory never collide.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{CompileError, CompiledUnit};

const MANIFEST: &str = "MANIFEST";

/// Archive table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Unit names in load order.
    pub units: Vec<String>,

    /// Unit the loader runs; the others only contribute functions.
    pub entry: Option<String>,
}

/// A staged archive. Dropping it deletes the file.
#[derive(Debug)]
pub struct StagingArchive {
    path: PathBuf,
}

impl StagingArchive {
    /// Write the blobs of `unit` to a fresh archive under `dir`.
    pub fn write(dir: &Path, unit: &CompiledUnit) -> Result<Self, CompileError> {
        std::fs::create_dir_all(dir).map_err(|e| CompileError::Stage(format!(
            "cannot create staging directory {}: {e}",
            dir.display()
        )))?;

        let archive = Self {
            path: dir.join(format!("{}.zip", uuid::Uuid::new_v4())),
        };
        // From here on the guard owns the path, so a partial write is removed too.
        archive.write_entries(unit).map_err(|e| CompileError::Stage(format!(
            "cannot write {}: {e}",
            archive.path.display()
        )))?;

        debug!(path = %archive.path.display(), units = unit.units.len(), "Staged compiled units");
        Ok(archive)
    }

    fn write_entries(&self, unit: &CompiledUnit) -> anyhow::Result<()> {
        let file = File::create(&self.path)?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let manifest = Manifest {
            units: unit.units.iter().map(|b| b.name.clone()).collect(),
            entry: unit.entry().map(str::to_string),
        };
        zip.start_file(MANIFEST, options)?;
        zip.write_all(&serde_json::to_vec(&manifest)?)?;

        for (index, blob) in unit.units.iter().enumerate() {
            zip.start_file(format!("units/{index}"), options)?;
            zip.write_all(blob.code.as_bytes())?;
        }

        zip.finish()?.flush()?;
        Ok(())
    }

    /// Read the manifest and every unit back, in manifest order.
    ///
    /// The returned blobs carry the names and code only; they are parsed
    /// again by whoever verifies them.
    pub fn read(&self) -> Result<(Manifest, Vec<(String, String)>), CompileError> {
        let load_err = |e: &dyn std::fmt::Display| CompileError::Load {
            unit: None,
            message: format!("{}: {e}", self.path.display()),
        };

        let file = File::open(&self.path).map_err(|e| load_err(&e))?;
        let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|e| load_err(&e))?;

        let manifest: Manifest = {
            let entry = zip.by_name(MANIFEST).map_err(|e| load_err(&e))?;
            serde_json::from_reader(entry).map_err(|e| load_err(&e))?
        };

        let mut units = Vec::with_capacity(manifest.units.len());
        for (index, name) in manifest.units.iter().enumerate() {
            let mut entry = zip
                .by_name(&format!("units/{index}"))
                .map_err(|e| CompileError::Load {
                    unit: Some(name.clone()),
                    message: e.to_string(),
                })?;
            let mut code = String::new();
            entry
                .read_to_string(&mut code)
                .map_err(|e| CompileError::Load {
                    unit: Some(name.clone()),
                    message: e.to_string(),
                })?;
            units.push((name.clone(), code));
        }

        Ok((manifest, units))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingArchive {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed staging archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove staging archive"),
        }
    }
}
