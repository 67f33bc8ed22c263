// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Controller descriptor and registry.
//!
//! Controller specs refer to controllers by name. The registry maps those
//! names (and their aliases) to controller implementations so that every
//! reference can be resolved once, during operator assembly.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::controller::{Controller, DynController};
use crate::error::ConfigError;

/// Descriptor for a controller.
///
/// # Example
///
/// ```ignore
/// let descriptor = ControllerDescriptor::builder("widgets")
///     .with_alias("widget")
///     .build(WidgetController::default());
/// ```
#[derive(Clone)]
pub struct ControllerDescriptor {
    /// Canonical name of the controller.
    name: String,

    /// Alternative names.
    aliases: Vec<String>,

    /// The implementation.
    controller: Arc<dyn DynController>,
}

impl ControllerDescriptor {
    /// Creates a new builder for a controller descriptor.
    pub fn builder(name: impl Into<String>) -> Builder {
        Builder::new(name)
    }

    /// Returns the canonical name of this controller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns all aliases for this controller.
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Returns the controller implementation.
    pub fn controller(&self) -> &Arc<dyn DynController> {
        &self.controller
    }
}

impl fmt::Debug for ControllerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerDescriptor")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .finish()
    }
}

/// Builder for creating [`ControllerDescriptor`] instances.
pub struct Builder {
    name: String,
    aliases: Vec<String>,
}

impl Builder {
    /// Creates a new builder with the given controller name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
        }
    }

    /// Adds an alias for this controller.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Builds the descriptor around a typed controller.
    pub fn build<C: Controller>(self, controller: C) -> ControllerDescriptor {
        self.build_dyn(Arc::new(controller))
    }

    /// Builds the descriptor around an already type-erased controller.
    pub fn build_dyn(self, controller: Arc<dyn DynController>) -> ControllerDescriptor {
        ControllerDescriptor {
            name: self.name,
            aliases: self.aliases,
            controller,
        }
    }
}

/// Registry of all known controllers.
#[derive(Debug, Clone, Default)]
pub struct ControllerRegistry {
    /// Map of canonical controller names to their descriptors.
    controllers: HashMap<String, ControllerDescriptor>,

    /// Map of aliases to canonical names.
    alias_map: HashMap<String, String>,
}

impl ControllerRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a controller descriptor.
    ///
    /// Fails if the name is empty, already registered, or if an alias collides
    /// with another name or alias.
    pub fn register(&mut self, descriptor: ControllerDescriptor) -> Result<&mut Self, ConfigError> {
        let name = descriptor.name();

        if name.is_empty() {
            return Err(ConfigError::EmptyControllerName);
        }

        if self.controllers.contains_key(name) || self.alias_map.contains_key(name) {
            return Err(ConfigError::DuplicateController(name.to_string()));
        }

        for alias in descriptor.aliases() {
            let owner = match self.controllers.get(alias) {
                Some(registered) => Some(registered.name()),
                None if alias == name => Some(name),
                None => None,
            };
            if let Some(owner) = owner {
                return Err(ConfigError::AliasConflict {
                    alias: alias.clone(),
                    existing: owner.to_string(),
                });
            }
            if let Some(existing) = self.alias_map.get(alias) {
                return Err(ConfigError::AliasConflict {
                    alias: alias.clone(),
                    existing: existing.clone(),
                });
            }
        }

        for alias in descriptor.aliases() {
            self.alias_map.insert(alias.clone(), name.to_string());
        }

        self.controllers.insert(name.to_string(), descriptor);
        Ok(self)
    }

    /// Registers a typed controller under `name`.
    pub fn register_controller<C: Controller>(
        &mut self,
        name: impl Into<String>,
        controller: C,
    ) -> Result<&mut Self, ConfigError> {
        self.register(ControllerDescriptor::builder(name).build(controller))
    }

    /// Returns the descriptor for the given name or alias.
    pub fn get(&self, name: &str) -> Option<&ControllerDescriptor> {
        self.controllers.get(name).or_else(|| {
            self.alias_map
                .get(name)
                .and_then(|canonical| self.controllers.get(canonical))
        })
    }

    /// Resolves an alias to its canonical name.
    pub fn resolve_alias(&self, name: &str) -> Option<&str> {
        self.alias_map.get(name).map(|s| s.as_str())
    }

    /// Returns all canonical controller names, sorted.
    pub fn controller_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.controllers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered controllers.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Returns true if no controller is registered.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::FunctionController;

    fn noop(name: &str) -> ControllerDescriptor {
        ControllerDescriptor::builder(name).build(FunctionController::new(name, |ctx| async move { Ok(ctx) }))
    }

    #[test]
    fn test_registry_basic() {
        let mut registry = ControllerRegistry::new();
        registry.register(noop("widgets")).unwrap();
        assert!(registry.get("widgets").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_duplicate_fails() {
        let mut registry = ControllerRegistry::new();
        registry.register(noop("widgets")).unwrap();
        let err = registry.register(noop("widgets")).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateController(name) if name == "widgets"));
    }

    #[test]
    fn test_registry_empty_name_fails() {
        let mut registry = ControllerRegistry::new();
        assert!(matches!(
            registry.register(noop("")),
            Err(ConfigError::EmptyControllerName)
        ));
    }

    #[test]
    fn test_alias_resolution() {
        let mut registry = ControllerRegistry::new();
        let descriptor = ControllerDescriptor::builder("widgets")
            .with_alias("widget")
            .with_alias("w")
            .build(FunctionController::new("widgets", |ctx| async move { Ok(ctx) }));
        registry.register(descriptor).unwrap();

        assert_eq!(registry.resolve_alias("widget"), Some("widgets"));
        assert_eq!(registry.get("w").map(|d| d.name()), Some("widgets"));
        assert!(registry.resolve_alias("unknown").is_none());
    }

    #[test]
    fn test_alias_conflict() {
        let mut registry = ControllerRegistry::new();
        registry
            .register(ControllerDescriptor::builder("a").with_alias("x").build(
                FunctionController::new("a", |ctx| async move { Ok(ctx) }),
            ))
            .unwrap();
        let err = registry
            .register(ControllerDescriptor::builder("b").with_alias("x").build(
                FunctionController::new("b", |ctx| async move { Ok(ctx) }),
            ))
            .unwrap_err();
        assert!(matches!(err, ConfigError::AliasConflict { existing, .. } if existing == "a"));
    }

    #[test]
    fn test_alias_conflict_with_canonical_name() {
        let mut registry = ControllerRegistry::new();
        registry.register(noop("widgets")).unwrap();

        let err = registry
            .register(ControllerDescriptor::builder("gadgets").with_alias("widgets").build(
                FunctionController::new("gadgets", |ctx| async move { Ok(ctx) }),
            ))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::AliasConflict { alias, existing } if alias == "widgets" && existing == "widgets"
        ));

        let err = registry
            .register(ControllerDescriptor::builder("gizmos").with_alias("gizmos").build(
                FunctionController::new("gizmos", |ctx| async move { Ok(ctx) }),
            ))
            .unwrap_err();
        assert!(matches!(err, ConfigError::AliasConflict { existing, .. } if existing == "gizmos"));
        assert_eq!(registry.len(), 1);
    }
}
