use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use core_model::{ImportError, Result};
use tempfile::TempDir;
use tracing::{debug, warn};
use zip::ZipArchive;

pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

/// A zip archive expanded into a private temporary directory. The directory
/// and everything in it is removed when this value is dropped.
pub struct ScratchArchive {
    dir: TempDir,
    origin: PathBuf,
    entries: usize,
}

impl ScratchArchive {
    pub fn extract(path: &Path) -> Result<Self> {
        let origin = path.display().to_string();
        let file = File::open(path)?;
        let mut zip = ZipArchive::new(file)
            .map_err(|e| ImportError::skipped(&origin, format!("unreadable archive: {e}")))?;
        let dir = tempfile::Builder::new().prefix("chatvault-").tempdir()?;
        debug!(origin = %origin, scratch = %dir.path().display(), "expanding archive");

        let mut entries = 0;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(|e| {
                ImportError::skipped(&origin, format!("unreadable archive entry {i}: {e}"))
            })?;
            let Some(relative) = entry.enclosed_name() else {
                warn!(origin = %origin, entry = entry.name(), "skipping archive entry outside extraction root");
                continue;
            };
            let target = dir.path().join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
            entries += 1;
        }

        Ok(Self {
            dir,
            origin: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn entries(&self) -> usize {
        self.entries
    }
}

impl Drop for ScratchArchive {
    fn drop(&mut self) {
        debug!(origin = %self.origin.display(), "releasing archive scratch dir");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, body) in files {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_nested_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("export.zip");
        write_zip(
            &zip_path,
            &[
                ("user.json", br#"{"id":"a"}"#),
                ("nested/conversations.json", b"[]"),
            ],
        );
        let scratch = ScratchArchive::extract(&zip_path).unwrap();
        assert_eq!(scratch.entries(), 2);
        assert!(scratch.path().join("user.json").is_file());
        assert!(scratch.path().join("nested/conversations.json").is_file());
    }

    #[test]
    fn scratch_dir_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("export.zip");
        write_zip(&zip_path, &[("user.json", b"{}")]);
        let scratch = ScratchArchive::extract(&zip_path).unwrap();
        let dir = scratch.path().to_path_buf();
        assert!(dir.exists());
        drop(scratch);
        assert!(!dir.exists());
    }

    #[test]
    fn skips_entries_escaping_root() {
        let tmp = tempfile::tempdir().unwrap();
        let inner = tmp.path().join("inner");
        fs::create_dir(&inner).unwrap();
        let zip_path = inner.join("evil.zip");
        write_zip(
            &zip_path,
            &[("../escaped.json", b"{}"), ("ok.json", b"{}")],
        );
        let scratch = ScratchArchive::extract(&zip_path).unwrap();
        assert_eq!(scratch.entries(), 1);
        assert!(scratch.path().join("ok.json").is_file());
        assert!(!tmp.path().join("escaped.json").exists());
    }

    #[test]
    fn corrupt_archive_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("broken.zip");
        fs::write(&zip_path, b"definitely not a zip").unwrap();
        let err = ScratchArchive::extract(&zip_path).err().unwrap();
        assert!(matches!(err, ImportError::Skipped { .. }));
    }

    #[test]
    fn is_archive_matches_extension() {
        assert!(is_archive(Path::new("a/b/Export.ZIP")));
        assert!(!is_archive(Path::new("a/b/user.json")));
        assert!(!is_archive(Path::new("zip")));
    }
}
