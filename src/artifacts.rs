//! Artifact storage
//!
//! Every session gets a namespaced directory under the artifact root holding
//! its browser profile, exported downloads, and step screenshots. Clients
//! address artifacts by bare filename; resolution and the traversal guard
//! live here, as does the debug bundler.

use chrono::Utc;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Subdirectory names under a session's root.
const DOWNLOADS: &str = "downloads";
const SCREENSHOTS: &str = "screenshots";
const PROFILE: &str = "profile";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_root(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn session_subdir(&self, session_id: &str, name: &str) -> std::io::Result<PathBuf> {
        let dir = self.session_root(session_id).join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn download_dir(&self, session_id: &str) -> std::io::Result<PathBuf> {
        self.session_subdir(session_id, DOWNLOADS)
    }

    pub fn screenshot_dir(&self, session_id: &str) -> std::io::Result<PathBuf> {
        self.session_subdir(session_id, SCREENSHOTS)
    }

    pub fn profile_dir(&self, session_id: &str) -> std::io::Result<PathBuf> {
        self.session_subdir(session_id, PROFILE)
    }

    /// Fresh screenshot path: `YYYYMMDD_HHMMSS_<micros>_<tag>.png`.
    pub fn screenshot_path(&self, session_id: &str, tag: &str) -> std::io::Result<PathBuf> {
        let dir = self.screenshot_dir(session_id)?;
        let now = Utc::now();
        let name = format!(
            "{}_{}_{}.png",
            now.format("%Y%m%d_%H%M%S"),
            now.timestamp_subsec_micros(),
            sanitize_tag(tag)
        );
        Ok(dir.join(name))
    }

    /// Destroy a session's entire directory tree (profile included).
    pub fn remove_session(&self, session_id: &str) {
        let dir = self.session_root(session_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(path = %dir.display(), error = %e, "failed to remove session dir");
            }
        }
    }

    /// Resolve a client-supplied filename to a real path.
    ///
    /// Order: flat at the root (debug bundles, cross-session exports), then
    /// under the session id parsed from the filename prefix, then a full
    /// tree walk. Whatever is found must canonicalize to inside the root.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        // Filename-only addressing; separators and dot-dots are never valid.
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return None;
        }

        let flat = self.root.join(name);
        if flat.is_file() {
            return self.guarded(flat);
        }

        // Screenshot and download names carry no session prefix, but bundle
        // names do ({session_id}_{timestamp}_{tag}.zip) and exported files
        // are often requested as {session_id}_{original}.
        if let Some(prefix) = name.split('_').next() {
            for sub in [DOWNLOADS, SCREENSHOTS] {
                let candidate = self.root.join(prefix).join(sub).join(name);
                if candidate.is_file() {
                    return self.guarded(candidate);
                }
            }
        }

        let found = find_by_name(&self.root, name)?;
        self.guarded(found)
    }

    /// Path-traversal guard: the canonical path must stay under the root.
    fn guarded(&self, path: PathBuf) -> Option<PathBuf> {
        let canonical = path.canonicalize().ok()?;
        let root = self.root.canonicalize().ok()?;
        canonical.starts_with(&root).then_some(canonical)
    }

    /// Zip a session's screenshots and downloads into a single archive at
    /// the root. Returns the archive filename.
    pub fn bundle_debug(&self, session_id: &str, tag: &str) -> std::io::Result<String> {
        let name = format!(
            "{}_{}_{}.zip",
            session_id,
            Utc::now().format("%Y%m%d_%H%M%S"),
            sanitize_tag(tag)
        );
        let file = std::fs::File::create(self.root.join(&name))?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for sub in [SCREENSHOTS, DOWNLOADS] {
            let dir = self.session_root(session_id).join(sub);
            if !dir.is_dir() {
                continue;
            }
            let mut entries: Vec<_> = std::fs::read_dir(&dir)?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .collect();
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let file_name = entry.file_name();
                let archive_path = format!("{sub}/{}", file_name.to_string_lossy());
                zip.start_file(archive_path, options)
                    .map_err(std::io::Error::other)?;
                let mut src = std::fs::File::open(entry.path())?;
                let mut buf = Vec::new();
                src.read_to_end(&mut buf)?;
                zip.write_all(&buf)?;
            }
        }

        zip.finish().map_err(std::io::Error::other)?;
        Ok(name)
    }
}

/// Keep tags filesystem-safe.
fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn find_by_name(dir: &Path, name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_by_name(&path, name) {
                return Some(found);
            }
        } else if path.file_name().and_then(|f| f.to_str()) == Some(name) {
            return Some(path);
        }
    }
    None
}
