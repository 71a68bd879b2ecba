//! Translation between client-visible virtual paths and real host paths.
//!
//! Clients only ever see POSIX-style absolute paths rooted at `/`, which map
//! onto a fixed real directory. Nothing here touches the filesystem.

use std::path::{Component, Path, PathBuf};

use crate::error::SandboxError;

#[derive(Debug, Clone)]
pub struct VirtualPathSandbox {
    root: PathBuf,
}

impl VirtualPathSandbox {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: normalize_real(root.as_ref()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a virtual path onto the real root.
    ///
    /// An empty path is the root itself. A path whose `..` segments would
    /// climb above the virtual root is rejected, as is anything that ends up
    /// outside the root after joining.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf, SandboxError> {
        if virtual_path.contains('\0') {
            return Err(SandboxError::NulByte);
        }

        let segments = clean_virtual(virtual_path)
            .ok_or_else(|| SandboxError::Escape(virtual_path.to_string()))?;

        let mut real = self.root.clone();
        for segment in &segments {
            real.push(segment);
        }

        if !is_path_within(&real, &self.root) {
            return Err(SandboxError::Escape(virtual_path.to_string()));
        }
        Ok(real)
    }

    /// Inverse of [`resolve`](Self::resolve) for display. Real paths outside
    /// the root are reported as `/`.
    pub fn virtualize(&self, real_path: &Path) -> String {
        let real = normalize_real(real_path);
        let Ok(relative) = real.strip_prefix(&self.root) else {
            return "/".to_string();
        };

        let segments: Vec<String> = relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(seg) => Some(seg.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        format!("/{}", segments.join("/"))
    }
}

pub fn is_path_within(path: &Path, root: &Path) -> bool {
    path == root || path.starts_with(root)
}

/// Split a virtual path into clean segments. Backslashes count as
/// separators. Returns `None` when `..` would pop past the virtual root.
fn clean_virtual(raw: &str) -> Option<Vec<String>> {
    let posix = raw.replace('\\', "/");
    let mut segments: Vec<String> = Vec::new();
    for segment in posix.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other.to_string()),
        }
    }
    Some(segments)
}

fn normalize_real(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push(Path::new("/")),
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            Component::Normal(seg) => out.push(seg),
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(Path::new("/"));
    }
    out
}
