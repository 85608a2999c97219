use crate::Resource;

/// Maps a resource to its relative storage path inside a cache tier root.
pub trait PathGenerator: Send + Sync {
    fn path_for(&self, resource: &Resource) -> String;
}

/// Lays artifacts out as `<location-name>/<resource-path>`.
pub struct DefaultPathGenerator;

impl PathGenerator for DefaultPathGenerator {
    fn path_for(&self, resource: &Resource) -> String {
        normalize_join(resource.location().name(), resource.path())
    }
}

/// Lexical normalization of a relative path: strips empty and `.` segments
/// and resolves `..` without touching the filesystem, so the result is stable
/// whether or not the file exists yet.
pub fn normalize_rel(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

pub fn normalize_join(base: &str, path: &str) -> String {
    let base = base.trim_matches('/');
    let path = path.trim_matches('/');
    if base.is_empty() {
        return normalize_rel(path);
    }
    if path.is_empty() {
        return normalize_rel(base);
    }
    normalize_rel(&format!("{}/{}", base, path))
}
