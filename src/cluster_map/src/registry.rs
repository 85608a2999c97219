use crate::ClusterMap;
use once_cell::sync::Lazy;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

static MAP_REGISTRY: Lazy<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-wide named instances, so collaborating components can share a map
/// by name instead of wiring it through every constructor.
pub fn get_or_create<V>(name: &str, default_ttl: Option<Duration>) -> Arc<ClusterMap<V>>
where
    V: Clone + Send + Sync + 'static,
{
    let mut registry = MAP_REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = registry.get(name) {
        if let Ok(map) = existing.clone().downcast::<ClusterMap<V>>() {
            return map;
        }
    }
    let map = match default_ttl {
        Some(ttl) => ClusterMap::with_default_ttl(name, ttl),
        None => ClusterMap::new(name),
    };
    registry.insert(name.to_string(), map.clone() as Arc<dyn Any + Send + Sync>);
    map
}

pub fn drop_instance(name: &str) {
    let mut registry = MAP_REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    registry.remove(name);
}
