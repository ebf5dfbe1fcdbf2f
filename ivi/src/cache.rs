/// Validity bookkeeping for cached instrument attributes.
///
/// Drivers keep attribute values in their own fields. The cache only tracks whether
/// such a field still reflects the instrument state.
use std::collections::HashMap;

/// Derive the cache tag from an accessor name, e.g. `_get_acquisition_type` becomes
/// `acquisition_type`.
pub fn cache_tag(name: &str) -> &str {
    let tag = name
        .strip_prefix("_get")
        .or_else(|| name.strip_prefix("_set"))
        .unwrap_or(name);
    tag.strip_prefix('_').unwrap_or(tag)
}

fn cache_key(tag: &str, index: Option<usize>) -> String {
    match index {
        Some(index) => format!("{}_{}", tag, index),
        None => tag.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct AttributeCache {
    enabled: bool,
    valid: HashMap<String, bool>,
}

impl Default for AttributeCache {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AttributeCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            valid: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Always false while caching is disabled. Unknown keys are recorded as invalid.
    pub fn is_valid(&mut self, tag: &str, index: Option<usize>) -> bool {
        if !self.enabled {
            return false;
        }
        *self.valid.entry(cache_key(tag, index)).or_insert(false)
    }

    pub fn mark_valid(&mut self, valid: bool, tag: &str, index: Option<usize>) {
        self.valid.insert(cache_key(tag, index), valid);
    }

    pub fn invalidate(&mut self, tag: &str, index: Option<usize>) {
        self.mark_valid(false, tag, index);
    }

    pub fn invalidate_all(&mut self) {
        log::debug!("Invalidating {} cached attributes", self.valid.len());
        self.valid.clear();
    }

    /// Number of known keys, valid or not.
    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags() {
        assert_eq!(cache_tag("_get_acquisition_type"), "acquisition_type");
        assert_eq!(cache_tag("_set_acquisition_type"), "acquisition_type");
        assert_eq!(cache_tag("_acquisition_type"), "acquisition_type");
        assert_eq!(cache_tag("acquisition_type"), "acquisition_type");
        assert_eq!(cache_tag("get_x"), "get_x");
        assert_eq!(cache_tag(""), "");
    }

    #[test]
    fn lazy_entries() {
        let mut cache = AttributeCache::default();
        assert!(cache.is_empty());
        assert!(!cache.is_valid("channel_enabled", Some(1)));
        assert_eq!(cache.len(), 1);

        cache.mark_valid(true, "channel_enabled", Some(1));
        assert!(cache.is_valid("channel_enabled", Some(1)));
        assert!(!cache.is_valid("channel_enabled", Some(2)));
        assert!(!cache.is_valid("channel_enabled", None));

        cache.invalidate("channel_enabled", Some(1));
        assert!(!cache.is_valid("channel_enabled", Some(1)));
    }

    #[test]
    fn invalidate_all() {
        let mut cache = AttributeCache::default();
        cache.mark_valid(true, "a", None);
        cache.mark_valid(true, "b", Some(0));
        cache.invalidate_all();
        assert!(!cache.is_valid("a", None));
        assert!(!cache.is_valid("b", Some(0)));
    }

    #[test]
    fn disabled() {
        let mut cache = AttributeCache::new(false);
        cache.mark_valid(true, "a", None);
        assert!(!cache.is_valid("a", None));
        cache.set_enabled(true);
        assert!(cache.is_valid("a", None));
    }
}
