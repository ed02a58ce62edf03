//! Named capabilities
//!
//! A process registers factories under stable names once, at startup. The
//! registry is immutable afterwards and can be enumerated, which is what a
//! peer sees when it queries the controller's capabilities.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

type Factory = Box<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// Capability lookup errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("Unknown capability: {0}")]
    Unknown(String),

    #[error("Capability '{0}' has a different type")]
    TypeMismatch(String),

    #[error("Capability '{0}' is already registered")]
    Duplicate(String),
}

/// Builds a [`CapabilityRegistry`]
#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    factories: BTreeMap<String, Factory>,
}

impl CapabilityRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`
    pub fn register<T, F>(mut self, name: impl Into<String>, factory: F) -> Result<Self, CapabilityError>
    where
        T: Any + Send,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(CapabilityError::Duplicate(name));
        }
        self.factories
            .insert(name, Box::new(move || Box::new(factory()) as Box<dyn Any + Send>));
        Ok(self)
    }

    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            factories: self.factories,
        }
    }
}

/// Immutable name to factory table
pub struct CapabilityRegistry {
    factories: BTreeMap<String, Factory>,
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::new()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Creates a fresh instance of a capability
    pub fn create(&self, name: &str) -> Result<Box<dyn Any + Send>, CapabilityError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| CapabilityError::Unknown(name.to_string()))
    }

    /// Like [`CapabilityRegistry::create`], downcast to `T`
    pub fn create_as<T: Any>(&self, name: &str) -> Result<T, CapabilityError> {
        self.create(name)?
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| CapabilityError::TypeMismatch(name.to_string()))
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Clipboard {
        text: String,
    }

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::builder()
            .register("shell", || 42_u32)
            .unwrap()
            .register("clipboard", || Clipboard {
                text: String::new(),
            })
            .unwrap()
            .build()
    }

    #[test]
    fn test_names_are_sorted() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["clipboard", "shell"]);
        assert!(registry.contains("shell"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_create_as_downcasts() {
        let registry = registry();
        assert_eq!(registry.create_as::<u32>("shell").unwrap(), 42);
        assert_eq!(
            registry.create_as::<Clipboard>("clipboard").unwrap(),
            Clipboard {
                text: String::new()
            }
        );
    }

    #[test]
    fn test_lookup_errors() {
        let registry = registry();
        assert_eq!(
            registry.create("screen").unwrap_err(),
            CapabilityError::Unknown("screen".into())
        );
        assert_eq!(
            registry.create_as::<String>("shell").unwrap_err(),
            CapabilityError::TypeMismatch("shell".into())
        );
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let result = CapabilityRegistry::builder()
            .register("shell", || 1_u8)
            .unwrap()
            .register("shell", || 2_u8);
        assert!(matches!(result, Err(CapabilityError::Duplicate(name)) if name == "shell"));
    }
}
