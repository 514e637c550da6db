//! Sibling source discovery.

use std::io;
use std::path::{Path, PathBuf};

/// Recursively list files under `root` with `extension`, sorted by path.
///
/// Directories named in `skip_dirs` and the files in `exclude` are left out.
/// Symlinked directories are not followed.
pub fn sibling_sources(
    root: &Path,
    extension: &str,
    skip_dirs: &[&str],
    exclude: &[&Path],
) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk(root, extension, skip_dirs, &mut found)?;
    found.retain(|path| !exclude.iter().any(|ex| same_file(path, ex)));
    found.sort();
    Ok(found)
}

fn walk(dir: &Path, extension: &str, skip_dirs: &[&str], found: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            let skipped = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| skip_dirs.contains(&n));
            if !skipped {
                walk(&path, extension, skip_dirs, found)?;
            }
        } else if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            found.push(path);
        }
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Unit name for `path`: relative to `root` when possible.
pub fn unit_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}
