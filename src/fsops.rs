//! Filesystem side of a transfer: discovering files to send, the cache
//! copy that insulates a transfer from external writers, and disposition
//! of sources and staged files once a verdict is in.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::config::{ReceiverLayout, SenderLayout, Verdict, CORRUPT_SUFFIX, IGNORED_FILES, PART_SUFFIX};
use crate::{Error, Result};

/// Invoked on every file and directory the receiver creates, so the host
/// can apply ownership or permissions. The transfer core has no opinion.
pub type CreateHook = Arc<dyn Fn(&Path) + Send + Sync>;

/// A file found in the incoming tree, addressed the way the wire wants
/// it: subfolder relative to the incoming root, plus the base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub source: PathBuf,
    pub subfolder: String,
    pub base: String,
}

impl Discovered {
    /// The name as transmitted: `subfolder/base`, or bare `base` at the
    /// root of the tree.
    pub fn wire_name(&self) -> String {
        if self.subfolder.is_empty() {
            self.base.clone()
        } else {
            format!("{}/{}", self.subfolder, self.base)
        }
    }
}

/// Walks the incoming tree and returns the files to transfer, oldest
/// directories first. Ignore-listed names are deleted on sight; entries
/// that cannot be read or carry non-UTF-8 names are logged and skipped.
pub fn scan(incoming: &Path) -> Vec<Discovered> {
    let mut found = Vec::new();
    for entry in WalkDir::new(incoming) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("skipping unreadable entry under {}: {}", incoming.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(base) = entry.file_name().to_str().map(str::to_owned) else {
            log::warn!("skipping non-UTF-8 file name {:?}", entry.file_name());
            continue;
        };
        if IGNORED_FILES.contains(&base.as_str()) {
            log::info!(
                "'{}' is on the ignore list; deleting {}",
                base,
                entry.path().display()
            );
            if let Err(e) = fs::remove_file(entry.path()) {
                log::warn!("could not delete ignored file {}: {}", entry.path().display(), e);
            }
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(incoming)
            .expect("walked path is under its root");
        let subfolder = match rel.parent().map(|p| p.to_str()) {
            Some(Some(s)) => s.to_owned(),
            _ => {
                log::warn!("skipping non-UTF-8 subfolder for {}", entry.path().display());
                continue;
            }
        };
        found.push(Discovered {
            source: entry.path().to_path_buf(),
            subfolder,
            base,
        });
    }
    found
}

/// Copies a discovered file into the cache tree, preserving its
/// subfolder, and returns the cache path the transfer will read from.
pub fn cache_copy(layout: &SenderLayout, discovered: &Discovered) -> Result<PathBuf> {
    let dir = layout.cache.join(&discovered.subfolder);
    fs::create_dir_all(&dir).map_err(|e| Error::storage(&dir, e))?;
    let dst = dir.join(&discovered.base);
    log::info!(
        "caching {} as {}",
        discovered.source.display(),
        dst.display()
    );
    fs::copy(&discovered.source, &dst).map_err(|e| Error::storage(&discovered.source, e))?;
    Ok(dst)
}

/// Moves the source file out of the incoming tree according to the
/// verdict. Filesystem trouble here is logged, never fatal: the next
/// scan pass will see the file again.
pub fn dispose_source(layout: &SenderLayout, discovered: &Discovered, verdict: Verdict) {
    let root = match verdict {
        Verdict::Delivered => &layout.transferred,
        Verdict::Failed => &layout.failed,
    };
    let dir = root.join(&discovered.subfolder);
    let dst = dir.join(&discovered.base);
    log::info!("moving {} to {}", discovered.source.display(), dst.display());
    let moved = fs::create_dir_all(&dir)
        .map_err(|e| Error::storage(&dir, e))
        .and_then(|()| move_file(&discovered.source, &dst));
    if let Err(e) = moved {
        log::error!(
            "could not move {} to {}: {}",
            discovered.source.display(),
            dst.display(),
            e
        );
    }
}

/// Removes the cache copy once a transfer is over, whatever its outcome.
pub fn drop_cache(cache_path: &Path) {
    log::info!("deleting cached file {}", cache_path.display());
    if let Err(e) = fs::remove_file(cache_path) {
        log::warn!("could not delete cache file {}: {}", cache_path.display(), e);
    }
}

/// Validates a wire-received name as a relative path with no traversal.
pub(crate) fn sanitize_relative(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let plain = !name.is_empty()
        && path.is_relative()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(path.to_path_buf())
    } else {
        Err(Error::BadName(name.to_owned()))
    }
}

/// Where the bytes of `relative` accumulate while a transfer is running.
pub(crate) fn staging_path(layout: &ReceiverLayout, relative: &Path) -> PathBuf {
    let mut name = relative
        .file_name()
        .unwrap_or_default()
        .to_os_string();
    name.push(PART_SUFFIX);
    match relative.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => layout.staging.join(parent).join(name),
        _ => layout.staging.join(name),
    }
}

/// Promotes a verified staging file into the output tree, dropping the
/// staging suffix.
pub(crate) fn promote(
    layout: &ReceiverLayout,
    staging: &Path,
    relative: &Path,
    hook: &Option<CreateHook>,
) -> Result<PathBuf> {
    let dst = layout.output.join(relative);
    if let Some(dir) = dst.parent() {
        ensure_dir(dir, hook)?;
    }
    log::info!("moving {} to {}", staging.display(), dst.display());
    move_file(staging, &dst)?;
    if let Some(hook) = hook {
        hook(&dst);
    }
    Ok(dst)
}

/// Demotes a staging file in place, keeping it for inspection.
pub(crate) fn demote(staging: &Path, hook: &Option<CreateHook>) -> Result<PathBuf> {
    let mut name = staging.file_name().unwrap_or_default().to_os_string();
    name.push(CORRUPT_SUFFIX);
    let dst = staging.with_file_name(name);
    log::info!("keeping corrupt file as {}", dst.display());
    fs::rename(staging, &dst).map_err(|e| Error::storage(staging, e))?;
    if let Some(hook) = hook {
        hook(&dst);
    }
    Ok(dst)
}

/// `create_dir_all` that reports each directory it actually created to
/// the post-create hook.
pub(crate) fn ensure_dir(dir: &Path, hook: &Option<CreateHook>) -> Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        ensure_dir(parent, hook)?;
    }
    fs::create_dir(dir).map_err(|e| Error::storage(dir, e))?;
    if let Some(hook) = hook {
        hook(dir);
    }
    Ok(())
}

/// Rename, falling back to copy-and-delete across filesystems.
pub(crate) fn move_file(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst).map_err(|e| Error::storage(dst, e))?;
            fs::remove_file(src).map_err(|e| Error::storage(src, e))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn touch(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap().write_all(content).unwrap();
    }

    #[test]
    fn scan_finds_files_with_subfolders() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming");
        touch(&incoming.join("top.bin"), b"1");
        touch(&incoming.join("a/b/deep.bin"), b"2");

        let mut found = scan(&incoming);
        found.sort_by(|x, y| x.base.cmp(&y.base));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].base, "deep.bin");
        assert_eq!(found[0].subfolder, "a/b");
        assert_eq!(found[0].wire_name(), "a/b/deep.bin");
        assert_eq!(found[1].base, "top.bin");
        assert_eq!(found[1].subfolder, "");
        assert_eq!(found[1].wire_name(), "top.bin");
    }

    #[test]
    fn scan_deletes_ignored_files() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming");
        touch(&incoming.join("Thumbs.db"), b"x");
        touch(&incoming.join("keep.bin"), b"y");

        let found = scan(&incoming);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].base, "keep.bin");
        assert!(!incoming.join("Thumbs.db").exists());
    }

    #[test]
    fn cache_copy_preserves_subfolder() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SenderLayout::under(dir.path(), dir.path().join("cache"));
        let d = Discovered {
            source: layout.incoming.join("sub/f.bin"),
            subfolder: "sub".into(),
            base: "f.bin".into(),
        };
        touch(&d.source, b"payload");

        let cached = cache_copy(&layout, &d).unwrap();
        assert_eq!(cached, dir.path().join("cache/sub/f.bin"));
        assert_eq!(fs::read(&cached).unwrap(), b"payload");
    }

    #[test]
    fn dispose_moves_by_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SenderLayout::under(dir.path(), dir.path().join("cache"));
        let d = Discovered {
            source: layout.incoming.join("sub/ok.bin"),
            subfolder: "sub".into(),
            base: "ok.bin".into(),
        };
        touch(&d.source, b"1");
        dispose_source(&layout, &d, Verdict::Delivered);
        assert!(layout.transferred.join("sub/ok.bin").exists());
        assert!(!d.source.exists());

        let d2 = Discovered {
            source: layout.incoming.join("bad.bin"),
            subfolder: String::new(),
            base: "bad.bin".into(),
        };
        touch(&d2.source, b"2");
        dispose_source(&layout, &d2, Verdict::Failed);
        assert!(layout.failed.join("bad.bin").exists());
    }

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize_relative("sub/a.bin").is_ok());
        assert!(sanitize_relative("a.bin").is_ok());
        assert!(sanitize_relative("").is_err());
        assert!(sanitize_relative("/etc/passwd").is_err());
        assert!(sanitize_relative("../up.bin").is_err());
        assert!(sanitize_relative("sub/../../up.bin").is_err());
    }

    #[test]
    fn staging_promote_and_demote() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ReceiverLayout::new(dir.path().join("tmp"), dir.path().join("out"));
        let rel = Path::new("sub/f.bin");

        let staging = staging_path(&layout, rel);
        assert_eq!(staging, layout.staging.join("sub/f.bin.part"));
        touch(&staging, b"bytes");

        let out = promote(&layout, &staging, rel, &None).unwrap();
        assert_eq!(out, layout.output.join("sub/f.bin"));
        assert!(out.exists());
        assert!(!staging.exists());

        touch(&staging, b"corrupt");
        let kept = demote(&staging, &None).unwrap();
        assert_eq!(kept, layout.staging.join("sub/f.bin.part.000"));
        assert!(kept.exists());
    }

    #[test]
    fn filesystem_failures_are_storage_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nowhere/f.bin.part");
        let err = demote(&missing, &None).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));

        let layout = SenderLayout::under(dir.path(), dir.path().join("cache"));
        let ghost = Discovered {
            source: layout.incoming.join("ghost.bin"),
            subfolder: String::new(),
            base: "ghost.bin".into(),
        };
        let err = cache_copy(&layout, &ghost).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }

    #[test]
    fn ensure_dir_reports_created_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: CreateHook = Arc::new(move |p: &Path| sink.lock().unwrap().push(p.to_path_buf()));

        let target = dir.path().join("a/b/c");
        ensure_dir(&target, &Some(hook)).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[dir.path().join("a"), dir.path().join("a/b"), dir.path().join("a/b/c")]
        );
    }
}
