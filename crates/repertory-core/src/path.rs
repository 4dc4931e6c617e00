//! `api_path` canonicalization
//!
//! An `api_path` is a forward-slash-rooted logical path in the mounted
//! namespace, e.g. `/dir/file.bin`. It is always canonicalized: no `.`/`..`
//! components, no duplicate slashes, no trailing slash except the root
//! `/` itself. Comparison is case-sensitive.

use crate::error::{ErrorKind, RepertoryError};

/// Canonicalize a raw path into an `api_path`.
///
/// Rejects `.`/`..` components and empty segments (duplicate slashes
/// collapse rather than error, matching the original's tolerant join
/// behavior when building paths from directory listings).
pub fn canonicalize(raw: &str) -> Result<String, RepertoryError> {
    if raw.is_empty() {
        return Ok("/".to_string());
    }

    let mut segments = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(RepertoryError::new(
                    ErrorKind::InvalidOperation,
                    format!("api_path must not contain '..': {raw}"),
                ));
            }
            seg => segments.push(seg),
        }
    }

    if segments.is_empty() {
        return Ok("/".to_string());
    }

    Ok(format!("/{}", segments.join("/")))
}

/// Is `path` already in canonical form?
pub fn is_canonical(path: &str) -> bool {
    canonicalize(path).map(|c| c == path).unwrap_or(false)
}

/// The root api_path.
pub const ROOT: &str = "/";

/// Is this the root path?
pub fn is_root(path: &str) -> bool {
    path == ROOT
}

/// The parent api_path, or `""` for the root (per spec §3.1/§3.2:
/// `api_parent` is `""` for root).
pub fn parent(path: &str) -> String {
    if is_root(path) {
        return String::new();
    }
    match path.rfind('/') {
        Some(0) => ROOT.to_string(),
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// The final path component (file or directory name).
pub fn name(path: &str) -> &str {
    if is_root(path) {
        return "";
    }
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a parent api_path with a single child name.
pub fn join(parent: &str, child: &str) -> String {
    if is_root(parent) {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Does `path` live under `prefix` (used by `rename_directory` to retarget
/// every open entry under a renamed subtree)?
pub fn is_under(path: &str, prefix: &str) -> bool {
    if is_root(prefix) {
        return true;
    }
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

/// Rewrite the `prefix` leading `path` to `new_prefix`, used when a
/// directory rename retargets every open descendant.
pub fn reparent(path: &str, prefix: &str, new_prefix: &str) -> String {
    if path == prefix {
        return new_prefix.to_string();
    }
    let suffix = &path[prefix.len()..];
    format!("{new_prefix}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_duplicate_slashes() {
        assert_eq!(canonicalize("//dir//file.bin").unwrap(), "/dir/file.bin");
    }

    #[test]
    fn canonicalizes_empty_and_root() {
        assert_eq!(canonicalize("").unwrap(), "/");
        assert_eq!(canonicalize("/").unwrap(), "/");
    }

    #[test]
    fn rejects_parent_component() {
        assert_eq!(
            canonicalize("/dir/../etc").unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
    }

    #[test]
    fn drops_trailing_slash_except_root() {
        assert_eq!(canonicalize("/dir/").unwrap(), "/dir");
    }

    #[test]
    fn parent_of_root_is_empty() {
        assert_eq!(parent("/"), "");
    }

    #[test]
    fn parent_of_top_level_is_root() {
        assert_eq!(parent("/file.bin"), "/");
    }

    #[test]
    fn parent_of_nested() {
        assert_eq!(parent("/dir/file.bin"), "/dir");
    }

    #[test]
    fn name_extraction() {
        assert_eq!(name("/dir/file.bin"), "file.bin");
        assert_eq!(name("/file.bin"), "file.bin");
        assert_eq!(name("/"), "");
    }

    #[test]
    fn join_from_root() {
        assert_eq!(join("/", "file.bin"), "/file.bin");
        assert_eq!(join("/dir", "file.bin"), "/dir/file.bin");
    }

    #[test]
    fn is_under_matches_prefix_and_descendants() {
        assert!(is_under("/dir/sub/file.bin", "/dir"));
        assert!(is_under("/dir", "/dir"));
        assert!(!is_under("/dirx/file.bin", "/dir"));
        assert!(is_under("/anything", "/"));
    }

    #[test]
    fn reparent_rewrites_prefix() {
        assert_eq!(
            reparent("/dir/sub/file.bin", "/dir", "/moved"),
            "/moved/sub/file.bin"
        );
        assert_eq!(reparent("/dir", "/dir", "/moved"), "/moved");
    }
}
