//! # Service Context
//!
//! A persistent map from capability tags to service implementations.
//!
//! Contexts are shared between fibers without locking: extending a context
//! produces a new map and leaves every existing holder untouched. A
//! [`Reference`] is a tag that also knows a process-wide default, used for
//! runtime services such as the clock.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::erased::{downcast_ref, erase, AnyValue, Data};

/// Typed key identifying a service in a [`Context`].
///
/// Two tags with the same key address the same slot, so keys should be
/// unique per service type.
pub struct Tag<S> {
    key: &'static str,
    _marker: PhantomData<fn() -> S>,
}

impl<S> Tag<S> {
    /// Create a tag.
    pub const fn new(key: &'static str) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    /// The tag's key.
    pub const fn key(&self) -> &'static str {
        self.key
    }
}

impl<S> Clone for Tag<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Tag<S> {}

impl<S> fmt::Debug for Tag<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.key)
    }
}

/// A tag with a default implementation used when the context lacks one.
pub struct Reference<S> {
    tag: Tag<S>,
    default: fn() -> S,
}

impl<S> Reference<S> {
    /// Create a reference.
    pub const fn new(key: &'static str, default: fn() -> S) -> Self {
        Self {
            tag: Tag::new(key),
            default,
        }
    }

    /// The underlying tag.
    pub const fn tag(&self) -> Tag<S> {
        self.tag
    }

    /// Build the default value.
    pub fn default_value(&self) -> S {
        (self.default)()
    }
}

/// Immutable service map with copy-on-extend semantics.
#[derive(Clone, Default)]
pub struct Context {
    services: Arc<HashMap<&'static str, AnyValue>>,
}

impl Context {
    /// The empty context.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A context holding one service.
    pub fn make<S: Data>(tag: Tag<S>, service: S) -> Self {
        Self::empty().add(tag, service)
    }

    /// Extend with a service, replacing any previous entry for the tag.
    pub fn add<S: Data>(&self, tag: Tag<S>, service: S) -> Self {
        let mut services = (*self.services).clone();
        services.insert(tag.key, erase(service));
        Self {
            services: Arc::new(services),
        }
    }

    /// Look up a service.
    pub fn get<S: Data>(&self, tag: Tag<S>) -> Option<S> {
        self.services
            .get(tag.key)
            .and_then(downcast_ref::<S>)
            .cloned()
    }

    /// Look up a service, falling back to the reference's default.
    pub fn get_or_default<S: Data>(&self, reference: &Reference<S>) -> S {
        self.get(reference.tag)
            .unwrap_or_else(|| reference.default_value())
    }

    /// True when a service is registered under the tag.
    pub fn contains<S>(&self, tag: Tag<S>) -> bool {
        self.services.contains_key(tag.key)
    }

    /// Combine two contexts; entries in `other` win on overlap.
    pub fn merge(&self, other: &Context) -> Self {
        if other.services.is_empty() {
            return self.clone();
        }
        if self.services.is_empty() {
            return other.clone();
        }
        let mut services = (*self.services).clone();
        for (key, value) in other.services.iter() {
            services.insert(key, value.clone());
        }
        Self {
            services: Arc::new(services),
        }
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True when the context holds no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Keys of all registered services, sorted.
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.services.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORT: Tag<u16> = Tag::new("test/Port");
    const HOST: Tag<String> = Tag::new("test/Host");
    static RETRIES: Reference<u32> = Reference::new("test/Retries", || 3);

    #[test]
    fn test_add_is_persistent() {
        let base = Context::make(PORT, 80);
        let extended = base.add(HOST, "localhost".to_string());

        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.get(PORT), Some(80));
        assert!(base.get(HOST).is_none());
    }

    #[test]
    fn test_merge_last_write_wins() {
        let left = Context::make(PORT, 80).add(HOST, "a".to_string());
        let right = Context::make(PORT, 8080);
        let merged = left.merge(&right);

        assert_eq!(merged.get(PORT), Some(8080));
        assert_eq!(merged.get(HOST).as_deref(), Some("a"));
        assert_eq!(merged.keys(), vec!["test/Host", "test/Port"]);
    }

    #[test]
    fn test_reference_default() {
        let ctx = Context::empty();
        assert_eq!(ctx.get_or_default(&RETRIES), 3);
        let ctx = ctx.add(RETRIES.tag(), 5);
        assert_eq!(ctx.get_or_default(&RETRIES), 5);
    }
}
