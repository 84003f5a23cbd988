//! Path utilities for SFTP operations
//!
//! Remote SFTP paths always use `/` (per SFTP protocol), even on Windows
//! servers. Local sources may arrive as plain paths or `file://` URIs.

use std::path::PathBuf;

use url::Url;

use super::error::SftpError;

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Resolve `path` against `cwd` and fold `.` and `..` segments.
pub fn resolve_remote_path(cwd: &str, path: &str) -> String {
    let joined = if is_absolute_remote_path(path) {
        path.to_string()
    } else {
        join_remote_path(cwd, path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Last segment of a remote path, or `None` for the root.
pub fn remote_file_name(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}

/// Path segments that are safe to recreate under a local directory.
pub fn safe_segments(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect()
}

/// Turn an upload source into a local path. Accepts `file://` URIs and plain
/// paths.
pub fn resolve_local_source(source: &str) -> Result<PathBuf, SftpError> {
    if source.starts_with("file:") {
        let url = Url::parse(source)
            .map_err(|e| SftpError::InvalidPath(format!("{}: {}", source, e)))?;
        return url
            .to_file_path()
            .map_err(|_| SftpError::InvalidPath(format!("{}: not a local file URI", source)));
    }
    if source.is_empty() {
        return Err(SftpError::InvalidPath("empty source".to_string()));
    }
    Ok(PathBuf::from(source))
}
