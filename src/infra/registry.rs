//! Reference-keyed object registry

use std::collections::HashMap;

/// An object that can be looked up by its reference
pub trait HasReference {
    fn reference(&self) -> &str;
}

/// Objects keyed by their own reference
#[derive(Debug, Clone)]
pub struct Registry<T: HasReference> {
    entries: HashMap<String, T>,
}

impl<T: HasReference> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: HasReference> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object, returning the one it replaced
    pub fn insert(&mut self, entry: T) -> Option<T> {
        self.entries.insert(entry.reference().to_string(), entry)
    }

    pub fn get(&self, reference: &str) -> Option<&T> {
        self.entries.get(reference)
    }

    pub fn get_mut(&mut self, reference: &str) -> Option<&mut T> {
        self.entries.get_mut(reference)
    }

    pub fn remove(&mut self, reference: &str) -> Option<T> {
        self.entries.remove(reference)
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.entries.contains_key(reference)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
