//! Small stand-alone helpers shared across components.
//!
//! Atomic write-then-rename and advisory file locks, adapted to the
//! permission modes this engine's output layout requires.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Permission mode for dump output files (`rw-r-----`).
pub const FILE_MODE: u32 = 0o640;
/// Permission mode for dump output directories (`rwxr-x---`).
pub const DIR_MODE: u32 = 0o750;

/// Write `data` to `path` atomically: write to a sibling temp file,
/// `fsync`, then rename over the destination. Uses `tempfile` rather
/// than raw `mkstemp` to avoid an unsafe `FromRawFd` dance.
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {:?}", dir))?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))?;
    tmp.persist(path)
        .with_context(|| format!("renaming temp file into {:?}", path))?;
    Ok(())
}

/// Create `dir` (and refuse if it exists and is non-empty, matching
/// the file backend's rules for dump targets).
pub fn create_empty_output_dir(dir: &Path) -> Result<()> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                bail!("output directory {:?} exists and is not empty", dir);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let parent = dir.parent();
            if !parent.map(|p| p.exists()).unwrap_or(false) {
                bail!("output directory {:?} parent does not exist", dir);
            }
            std::fs::create_dir(dir)?;
        }
        Err(e) => return Err(e.into()),
    }
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE))?;
    Ok(())
}

/// Normalize a MySQL identifier for filter matching: strip surrounding
/// backticks/quotes and unescape doubled quote characters, so
/// `includeX`/`excludeX` dotted names compare correctly regardless of
/// how the user quoted them.
pub fn normalize_identifier(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 {
        let bytes = trimmed.as_bytes();
        let first = bytes[0] as char;
        let last = bytes[bytes.len() - 1] as char;
        if (first == '`' && last == '`') || (first == '"' && last == '"') {
            let inner = &trimmed[1..trimmed.len() - 1];
            let doubled = [first; 2].iter().collect::<String>();
            return inner.replace(&doubled, &first.to_string());
        }
    }
    trimmed.to_string()
}

/// Split a dotted `schema.object` filter name into its parts. A name
/// with no dot is treated as a schema-only filter.
pub fn split_dotted(name: &str) -> (String, Option<String>) {
    match name.split_once('.') {
        Some((schema, obj)) => (
            normalize_identifier(schema),
            Some(normalize_identifier(obj)),
        ),
        None => (normalize_identifier(name), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_backticks() {
        assert_eq!(normalize_identifier("`my db`"), "my db");
        assert_eq!(normalize_identifier("plain"), "plain");
        assert_eq!(normalize_identifier("`a``b`"), "a`b");
    }

    #[test]
    fn split_dotted_name() {
        assert_eq!(
            split_dotted("`s1`.`t1`"),
            ("s1".to_string(), Some("t1".to_string()))
        );
        assert_eq!(split_dotted("s1"), ("s1".to_string(), None));
    }
}
