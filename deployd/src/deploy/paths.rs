//! Remote path normalization

/// Name of the marker file holding the deployed revision
pub const REVISION_FILE: &str = "REVISION";

/// Absolute remote directory of a deployment, always ending in `/`.
///
/// `rtrim(root, "/") + "/" + trim(path, "/") + "/"` with `//` collapsed.
pub fn remote_path(root_path: &str, target_path: &str) -> String {
    let target = target_path.trim().trim_matches('/');
    let joined = format!("{}/{}/", root_path.trim_end_matches('/'), target);
    let mut normalized = joined.replace("//", "/");
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }
    normalized
}

/// Remote location of the revision marker for a deployment directory
pub fn marker_path(remote_path: &str) -> String {
    format!("{}{}", remote_path, REVISION_FILE)
}
