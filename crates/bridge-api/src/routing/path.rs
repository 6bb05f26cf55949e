//! Path utilities for the auth proxy
//!
//! Single source of truth for path composition used by the Director, the
//! `/auth/*` endpoints and mount-point dispatch.

/// Join two path (or URL) fragments with exactly one slash at the seam.
///
/// Any run of trailing slashes on `base` and leading slashes on `suffix`
/// collapses into a single `/`, so the result does not depend on whether a
/// base path was configured with or without a trailing slash.
///
/// # Examples
///
/// ```
/// use bridge_api::routing::single_joining_slash;
///
/// assert_eq!(single_joining_slash("https://bridge.example/", "/auth/login"),
///            "https://bridge.example/auth/login");
/// assert_eq!(single_joining_slash("/api", "v1/pods"), "/api/v1/pods");
/// ```
pub fn single_joining_slash(base: &str, suffix: &str) -> String {
    let base = base.trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');
    let mut joined = String::with_capacity(base.len() + suffix.len() + 1);
    joined.push_str(base);
    joined.push('/');
    joined.push_str(suffix);
    joined
}

/// Strip a mount point from a request path, yielding the path relative to it.
///
/// Returns `None` when `path` is not under `mount`. The mount matches on
/// whole segments: `/api/` matches `/api` and `/api/v1` but not `/apis/v1`.
///
/// # Examples
///
/// ```
/// use bridge_api::routing::strip_mount_prefix;
///
/// assert_eq!(strip_mount_prefix("/api/v1/pods", "/api/"), Some("/v1/pods"));
/// assert_eq!(strip_mount_prefix("/apis/v1", "/api/"), None);
/// ```
pub fn strip_mount_prefix<'a>(path: &'a str, mount: &str) -> Option<&'a str> {
    let mount = mount.trim_end_matches('/');
    let rest = path.strip_prefix(mount)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}
