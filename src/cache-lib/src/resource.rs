use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Location attribute that overrides the shared store root for read paths.
pub const ATTR_ALT_STORAGE_LOCATION: &str = "alt-storage-location";

/// A named artifact source. Locations are compared by name only; attributes
/// carry per-location tuning such as an alternative storage directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    name: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

impl Location {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.as_str())
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Location {}

impl Hash for Location {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// A concrete artifact: a location plus a relative path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    location: Arc<Location>,
    path: String,
}

impl Resource {
    pub fn new(location: Arc<Location>, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = path.trim_start_matches('/').to_string();
        Self { location, path }
    }

    pub fn location(&self) -> &Arc<Location> {
        &self.location
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The root of a location, i.e. the location directory itself.
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.location.name(), self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_eq_by_name() {
        let a = Location::new("central").with_attribute("k", "v1");
        let b = Location::new("central").with_attribute("k", "v2");
        assert_eq!(a, b);
    }

    #[test]
    fn test_resource_root_and_path() {
        let loc = Arc::new(Location::new("central"));
        let root = Resource::new(loc.clone(), "");
        assert!(root.is_root());

        let file = Resource::new(loc, "/org/foo/foo-1.0.jar");
        assert!(!file.is_root());
        assert_eq!(file.path(), "org/foo/foo-1.0.jar");
        assert_eq!(file.to_string(), "central:/org/foo/foo-1.0.jar");
    }
}
