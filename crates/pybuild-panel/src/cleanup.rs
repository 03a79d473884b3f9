//! Source-tree sweep run after `setup.py clean -a`.
//!
//! `clean` leaves in-place build products behind: compiled extensions next to their
//! sources and the C/C++ files Cython generated. Binary artifacts are removed by extension;
//! `.c`/`.cpp` files only when their first line says Cython wrote them.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

pub const ARTIFACT_EXTENSIONS: &[&str] = &["o", "so", "pyd", "dll", "dylib"];
pub const GENERATED_SOURCE_EXTENSIONS: &[&str] = &["c", "cpp"];

const MAX_FIRST_LINE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupEvent {
    /// Emitted right before the file is deleted. Paths are relative to the scan root.
    Removing(PathBuf),
    Failed { path: PathBuf, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

/// Returns every file under `root` that the sweep would delete, in walk order.
pub fn scan(root: &Path) -> Result<Vec<PathBuf>> {
    let mut marked = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.io_error()
                    .is_some_and(|io| io.kind() == io::ErrorKind::PermissionDenied)
                {
                    tracing::warn!(error = %e, "skipping unreadable directory during cleanup");
                    continue;
                }
                return Err(Error::msg(format!("walkdir error: {e}")));
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if should_remove(entry.path(), name) {
            marked.push(entry.into_path());
        }
    }
    Ok(marked)
}

/// Scans `root` and deletes what [`scan`] marks. Each file is announced through
/// `on_event` before deletion; a failed deletion is announced and recorded, and the sweep
/// carries on with the rest.
pub fn scan_and_remove(
    root: &Path,
    mut on_event: impl FnMut(&CleanupEvent),
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    for path in scan(root)? {
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        on_event(&CleanupEvent::Removing(rel.clone()));
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %rel.display(), "removed build artifact");
                report.removed.push(rel);
            }
            Err(e) => {
                tracing::warn!(path = %rel.display(), error = %e, "failed to remove build artifact");
                let error = e.to_string();
                on_event(&CleanupEvent::Failed {
                    path: rel.clone(),
                    error: error.clone(),
                });
                report.failures.push((rel, error));
            }
        }
    }
    Ok(report)
}

fn should_remove(path: &Path, name: &str) -> bool {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return false;
    };
    if ARTIFACT_EXTENSIONS.contains(&ext) {
        return true;
    }
    if !GENERATED_SOURCE_EXTENSIONS.contains(&ext) {
        return false;
    }
    match first_line_says_cython(path) {
        Ok(hit) => hit,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot sniff source file; keeping it");
            false
        }
    }
}

fn first_line_says_cython(path: &Path) -> io::Result<bool> {
    let mut reader = BufReader::new(File::open(path)?).take(MAX_FIRST_LINE_BYTES);
    let mut first = Vec::new();
    reader.read_until(b'\n', &mut first)?;
    Ok(cython_marker_re().is_match(&String::from_utf8_lossy(&first)))
}

fn cython_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?ix) generated \x20+ by \x20+ cython")
            .expect("cython marker pattern must compile")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str, body: &str) {
        let p = root.join(rel);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(p, body).expect("write");
    }

    #[test]
    fn marks_binaries_and_cython_output_only() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        touch(root, "a.o", "");
        touch(root, "b.so", "");
        touch(root, "c.cpp", "// generated by Cython 0.29\nint x;\n");
        touch(root, "d.cpp", "// hand-written\n// generated by Cython (second line)\n");

        let mut marked: Vec<PathBuf> = scan(root)
            .expect("scan")
            .into_iter()
            .map(|p| p.strip_prefix(root).expect("under root").to_path_buf())
            .collect();
        marked.sort();
        assert_eq!(
            marked,
            vec![PathBuf::from("a.o"), PathBuf::from("b.so"), PathBuf::from("c.cpp")]
        );
    }

    #[test]
    fn walks_subdirectories_and_reports_relative_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        touch(root, "pkg/_speedups.c", "/* Generated by Cython 3.0.10 */\n");
        touch(root, "pkg/_speedups.cpython-312-x86_64-linux-gnu.so", "");
        touch(root, "pkg/win/_speedups.pyd", "");
        touch(root, "pkg/native.c", "#include <Python.h>\n");
        touch(root, "pkg/module.py", "");
        touch(root, "README", "");

        let mut seen = Vec::new();
        let report = scan_and_remove(root, |ev| seen.push(ev.clone())).expect("cleanup");

        let expected = vec![
            PathBuf::from("pkg/_speedups.c"),
            PathBuf::from("pkg/_speedups.cpython-312-x86_64-linux-gnu.so"),
            PathBuf::from("pkg/win/_speedups.pyd"),
        ];
        assert_eq!(report.removed, expected);
        assert!(report.failures.is_empty());
        assert_eq!(
            seen,
            expected
                .iter()
                .cloned()
                .map(CleanupEvent::Removing)
                .collect::<Vec<_>>()
        );
        assert!(root.join("pkg/native.c").exists());
        assert!(root.join("pkg/module.py").exists());
        assert!(!root.join("pkg/_speedups.c").exists());
    }

    #[test]
    fn failed_deletion_does_not_stop_the_sweep() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().to_path_buf();
        touch(&root, "a.o", "");
        touch(&root, "b.o", "");
        touch(&root, "c.o", "");

        // Deleting b.o behind the sweep's back makes its own removal fail.
        let report = scan_and_remove(&root, |ev| {
            if ev == &CleanupEvent::Removing(PathBuf::from("a.o")) {
                fs::remove_file(root.join("b.o")).expect("remove b.o");
            }
        })
        .expect("cleanup");

        assert_eq!(report.removed, vec![PathBuf::from("a.o"), PathBuf::from("c.o")]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, PathBuf::from("b.o"));
    }

    #[test]
    fn extension_match_is_exact() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        touch(root, "notes.solution", "");
        touch(root, "archive.o.txt", "");
        touch(root, "Makefile", "");
        assert!(scan(root).expect("scan").is_empty());
    }
}
