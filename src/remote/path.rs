//! Remote path utilities
//!
//! Remote paths always use `/` as separator, for both SFTP and FTP servers
//! (Windows servers included). Every path is normalized before it reaches a
//! protocol session or forms an operation lock key, so `/a/./b.txt` and
//! `/a//b.txt` contend for the same lock.

/// Check if a remote path is absolute.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Normalize an absolute remote path: collapse duplicate separators and
/// resolve `.` and `..`. `..` never climbs above `/`.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Resolve `path` against `root` (used for relative paths) and normalize.
pub fn resolve(root: &str, path: &str) -> String {
    let trimmed = path.trim();
    if is_absolute(trimmed) {
        normalize(trimmed)
    } else if trimmed.is_empty() {
        normalize(root)
    } else {
        normalize(&join(root, trimmed))
    }
}

/// Join remote path components using `/` separator.
pub fn join(base: &str, component: &str) -> String {
    let component = component.trim_start_matches('/');
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Parent directory of a normalized path; `/` is its own parent.
pub fn parent(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Final component of a path (empty for `/`).
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Whether `path` is `ancestor` itself or lies beneath it.
pub fn is_within(ancestor: &str, path: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}
