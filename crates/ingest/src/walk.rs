use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use archive::ScratchArchive;
use core_model::{ImportError, Result, ident::default_aliases, logical_table_name};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Html,
}

impl PayloadFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(PayloadFormat::Json),
            "html" | "htm" => Some(PayloadFormat::Html),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Payload {
    // archive members as `outer.zip!/inner/path`
    pub origin: String,
    pub path: PathBuf,
    pub suggested_name: String,
    pub format: PayloadFormat,
    pub bytes: Vec<u8>,
}

struct Frame {
    entries: walkdir::IntoIter,
    root: PathBuf,
    label: Option<String>,
    // Held so the extracted files outlive the walk over them.
    scratch: Option<ScratchArchive>,
}

impl Frame {
    fn new(root: &Path, label: Option<String>, scratch: Option<ScratchArchive>) -> Self {
        Self {
            entries: WalkDir::new(root)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter(),
            root: root.to_path_buf(),
            label,
            scratch,
        }
    }

    fn origin_of(&self, path: &Path) -> String {
        match &self.label {
            Some(label) => {
                let inner = path.strip_prefix(&self.root).unwrap_or(path);
                format!("{label}!/{}", inner.display())
            }
            None => path.display().to_string(),
        }
    }
}

/// Lazy depth-first walk. Archives are expanded when reached and their
/// scratch directory is released as soon as their entries are exhausted, or
/// when the walker is dropped.
pub struct SourceWalker {
    stack: Vec<Frame>,
    aliases: HashMap<String, String>,
}

impl SourceWalker {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            stack: vec![Frame::new(root.as_ref(), None, None)],
            aliases: default_aliases(),
        }
    }

    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases;
        self
    }

    #[cfg(test)]
    fn open_archives(&self) -> usize {
        self.stack.iter().filter(|f| f.scratch.is_some()).count()
    }

    fn load(&self, path: PathBuf, origin: String) -> Result<Payload> {
        let Some(format) = PayloadFormat::from_path(&path) else {
            return Err(ImportError::skipped(origin, "unsupported file type"));
        };
        let bytes = fs::read(&path)
            .map_err(|e| ImportError::skipped(&origin, format!("unreadable: {e}")))?;
        if bytes.is_empty() {
            return Err(ImportError::skipped(origin, "empty file"));
        }
        let suggested_name = logical_table_name(&path, &self.aliases)
            .map_err(|_| ImportError::skipped(&origin, "file name yields no table name"))?;
        debug!(origin = %origin, table = %suggested_name, bytes = bytes.len(), "read source");
        Ok(Payload {
            origin,
            path,
            suggested_name,
            format,
            bytes,
        })
    }
}

impl Iterator for SourceWalker {
    type Item = Result<Payload>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            let Some(entry) = frame.entries.next() else {
                self.stack.pop();
                continue;
            };
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let origin = err
                        .path()
                        .map(|p| frame.origin_of(p))
                        .unwrap_or_else(|| frame.root.display().to_string());
                    return Some(Err(ImportError::skipped(origin, err.to_string())));
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let origin = frame.origin_of(entry.path());
            let path = entry.into_path();

            if archive::is_archive(&path) {
                match ScratchArchive::extract(&path) {
                    Ok(scratch) => {
                        debug!(origin = %origin, files = scratch.entries(), "archive expanded");
                        let dir = scratch.path().to_path_buf();
                        self.stack.push(Frame::new(&dir, Some(origin), Some(scratch)));
                        continue;
                    }
                    Err(ImportError::Skipped { reason, .. }) => {
                        return Some(Err(ImportError::skipped(origin, reason)));
                    }
                    Err(err) => return Some(Err(err)),
                }
            }
            return Some(self.load(path, origin));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, body) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn collect(walker: SourceWalker) -> (Vec<Payload>, Vec<ImportError>) {
        let mut ok = Vec::new();
        let mut errs = Vec::new();
        for item in walker {
            match item {
                Ok(p) => ok.push(p),
                Err(e) => errs.push(e),
            }
        }
        (ok, errs)
    }

    #[test]
    fn single_file_root() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("user.json");
        fs::write(&path, br#"{"id":"a1"}"#).unwrap();
        let (payloads, errs) = collect(SourceWalker::new(&path));
        assert!(errs.is_empty());
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].suggested_name, "user");
        assert_eq!(payloads[0].format, PayloadFormat::Json);
    }

    #[test]
    fn directory_walk_is_sorted_and_recursive() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("b.json"), b"[]").unwrap();
        fs::write(tmp.path().join("a.json"), b"[]").unwrap();
        fs::write(tmp.path().join("sub/chat.HTML"), b"<html></html>").unwrap();
        let (payloads, errs) = collect(SourceWalker::new(tmp.path()));
        assert!(errs.is_empty());
        let names: Vec<_> = payloads.iter().map(|p| p.suggested_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "conversations"]);
        assert_eq!(payloads[2].format, PayloadFormat::Html);
    }

    #[test]
    fn empty_and_unknown_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("empty.json"), b"").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"hello").unwrap();
        fs::write(tmp.path().join("user.json"), b"{}").unwrap();
        let (payloads, errs) = collect(SourceWalker::new(tmp.path()));
        assert_eq!(payloads.len(), 1);
        assert_eq!(errs.len(), 2);
        assert!(errs.iter().all(|e| matches!(e, ImportError::Skipped { .. })));
    }

    #[test]
    fn nested_archives_are_expanded_and_released() {
        let tmp = tempfile::tempdir().unwrap();
        let inner = zip_bytes(&[("feedback.json", br#"[{"id":"f1"}]"#)]);
        let outer = zip_bytes(&[
            ("inner.zip", inner.as_slice()),
            ("user.json", br#"{"id":"u1"}"#),
        ]);
        let outer_path = tmp.path().join("export.zip");
        File::create(&outer_path).unwrap().write_all(&outer).unwrap();

        let mut walker = SourceWalker::new(&outer_path);
        let first = walker.next().unwrap().unwrap();
        assert_eq!(first.suggested_name, "feedback");
        assert!(first.origin.contains("export.zip!/inner.zip!/feedback.json"));
        assert_eq!(walker.open_archives(), 2);
        let scratch = first.path.parent().unwrap().to_path_buf();
        assert!(scratch.exists());

        let second = walker.next().unwrap().unwrap();
        assert_eq!(second.suggested_name, "user");
        assert_eq!(walker.open_archives(), 1);
        assert!(!scratch.exists(), "inner archive released once exhausted");

        let outerscratch = second.path.parent().unwrap().to_path_buf();
        drop(walker);
        assert!(!outerscratch.exists());
    }

    #[test]
    fn corrupt_archive_is_skipped_with_origin() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("broken.zip"), b"nope").unwrap();
        fs::write(tmp.path().join("user.json"), b"{}").unwrap();
        let (payloads, errs) = collect(SourceWalker::new(tmp.path()));
        assert_eq!(payloads.len(), 1);
        match &errs[..] {
            [ImportError::Skipped { origin, .. }] => assert!(origin.ends_with("broken.zip")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_files_are_followed() {
        let data = tempfile::tempdir().unwrap();
        let target = data.path().join("user.json");
        fs::write(&target, br#"{"id":"u1"}"#).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(&target, tmp.path().join("user.json")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone.json"), tmp.path().join("dangling.json"))
            .unwrap();

        let (payloads, errs) = collect(SourceWalker::new(tmp.path()));
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].suggested_name, "user");
        assert_eq!(payloads[0].bytes, br#"{"id":"u1"}"#);
        assert_eq!(errs.len(), 1, "dangling link is reported");
        assert!(matches!(errs[0], ImportError::Skipped { .. }));
    }

    #[test]
    fn missing_root_reports_error() {
        let (payloads, errs) = collect(SourceWalker::new("/definitely/not/here"));
        assert!(payloads.is_empty());
        assert_eq!(errs.len(), 1);
    }
}
