//! Cache of variable containers observed at the current paused state.
//!
//! Server-issued reference numbers are weak, pause-scoped handles: a new
//! call-stack snapshot invalidates every one of them at once. The cache is
//! therefore epoch-tagged - [`VariableCache::clear`] bumps the epoch, and
//! an insert carrying a stale epoch is discarded so a response that raced
//! the invalidation cannot resurrect a dead reference.

use std::collections::HashMap;

use crate::proto::Variable;

#[derive(Debug, Clone)]
pub(super) struct Container {
    pub descriptor: Variable,
    pub children: Option<Vec<Variable>>,
}

#[derive(Debug, Default)]
pub(super) struct VariableCache {
    epoch: u64,
    entries: HashMap<u32, Container>,
}

impl VariableCache {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Invalidate every cached reference.
    pub fn clear(&mut self) {
        self.epoch += 1;
        self.entries.clear();
    }

    /// Remember a container without resolved children yet. A container is
    /// immutable once cached: re-inserting an already known reference is a
    /// no-op, as is an insert tagged with a stale epoch.
    pub fn insert(&mut self, epoch: u64, descriptor: Variable) {
        self.insert_container(epoch, descriptor, None);
    }

    pub fn insert_container(
        &mut self,
        epoch: u64,
        descriptor: Variable,
        children: Option<Vec<Variable>>,
    ) {
        if epoch != self.epoch {
            log::debug!(
                target: "debugger",
                "discarding stale cache insert for reference {}",
                descriptor.variables_reference
            );
            return;
        }
        self.entries
            .entry(descriptor.variables_reference)
            .or_insert(Container {
                descriptor,
                children,
            });
    }

    /// Attach resolved children to an already cached reference.
    pub fn set_children(&mut self, epoch: u64, reference: u32, children: Vec<Variable>) {
        if epoch != self.epoch {
            log::debug!(
                target: "debugger",
                "discarding stale children for reference {reference}"
            );
            return;
        }
        if let Some(entry) = self.entries.get_mut(&reference) {
            entry.children.get_or_insert(children);
        }
    }

    pub fn contains(&self, reference: u32) -> bool {
        self.entries.contains_key(&reference)
    }

    pub fn descriptor(&self, reference: u32) -> Option<Variable> {
        self.entries.get(&reference).map(|e| e.descriptor.clone())
    }

    pub fn children(&self, reference: u32) -> Option<Vec<Variable>> {
        self.entries.get(&reference).and_then(|e| e.children.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, reference: u32) -> Variable {
        Variable {
            name: name.to_string(),
            variables_reference: reference,
            r#type: "table".to_string(),
            value: "{...}".to_string(),
        }
    }

    #[test]
    fn test_insert_and_expand() {
        let mut cache = VariableCache::default();
        let epoch = cache.epoch();
        cache.insert(epoch, var("self", 10));
        assert!(cache.contains(10));
        assert_eq!(cache.children(10), None);

        cache.set_children(epoch, 10, vec![var("x", 0)]);
        assert_eq!(cache.children(10).unwrap().len(), 1);
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let mut cache = VariableCache::default();
        let epoch = cache.epoch();
        cache.insert_container(epoch, var("locals", 5), Some(vec![var("a", 0)]));
        cache.clear();
        assert!(!cache.contains(5));
        assert_eq!(cache.children(5), None);
    }

    #[test]
    fn test_stale_epoch_insert_is_discarded() {
        let mut cache = VariableCache::default();
        let old_epoch = cache.epoch();
        cache.clear();
        cache.insert(old_epoch, var("ghost", 7));
        assert!(!cache.contains(7));

        cache.insert(cache.epoch(), var("live", 8));
        cache.clear();
        cache.set_children(old_epoch, 8, vec![var("child", 0)]);
        assert_eq!(cache.children(8), None);
    }

    #[test]
    fn test_cached_entries_are_immutable() {
        let mut cache = VariableCache::default();
        let epoch = cache.epoch();
        cache.insert_container(epoch, var("first", 3), Some(vec![var("a", 0)]));
        cache.insert_container(epoch, var("second", 3), Some(vec![var("b", 0), var("c", 0)]));
        assert_eq!(cache.descriptor(3).unwrap().name, "first");
        assert_eq!(cache.children(3).unwrap().len(), 1);
    }
}
