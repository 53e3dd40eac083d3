//! Caller-defined extension fields and behaviors.
//!
//! Directors and workers can carry extra named parameters and methods
//! supplied at construction. Methods receive the extension set they belong
//! to, so one method can read parameters or call another:
//!
//! ```
//! use queue_director::scheduler::Extensions;
//! use serde_json::{json, Value};
//!
//! let ext = Extensions::builder()
//!     .param("label", json!("director"))
//!     .method("count_good", |_, args| {
//!         let good = args.iter().filter(|v| !v.is_null()).count();
//!         Ok(Value::from(good))
//!     })
//!     .build()
//!     .unwrap();
//!
//! let count = ext.call("count_good", &[json!(1), Value::Null]).unwrap();
//! assert_eq!(count, json!(1));
//! ```
//!
//! Names must be unique within a set, and the owner rejects names that
//! collide with its own reserved members.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::config::ConfigError;
use crate::error::ExtensionError;

/// Signature of an extension method.
pub type ExtensionMethod =
    Arc<dyn Fn(&Extensions, &[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// A named set of extension parameters and methods.
#[derive(Clone, Default)]
pub struct Extensions {
    params: BTreeMap<String, Value>,
    methods: BTreeMap<String, ExtensionMethod>,
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("params", &self.params)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Extensions {
    /// Returns a builder for a new extension set.
    pub fn builder() -> ExtensionsBuilder {
        ExtensionsBuilder::default()
    }

    /// An empty extension set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the set has no parameters and no methods.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.methods.is_empty()
    }

    /// Returns a parameter by name.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Whether a method with `name` exists.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Calls a method by name.
    ///
    /// # Errors
    ///
    /// Returns `ExtensionError::UnknownMethod` if no such method exists, or
    /// `ExtensionError::MethodFailed` if the method itself fails.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, ExtensionError> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| ExtensionError::UnknownMethod(name.to_string()))?;

        method(self, args).map_err(|e| ExtensionError::MethodFailed {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Iterates over every parameter and method name.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params
            .keys()
            .chain(self.methods.keys())
            .map(String::as_str)
    }

    /// Rejects any name that appears in `reserved`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ExtensionNameCollision` naming the first clash.
    pub fn ensure_available(&self, scope: &str, reserved: &[&str]) -> Result<(), ConfigError> {
        match self.names().find(|name| reserved.contains(name)) {
            Some(name) => Err(ConfigError::ExtensionNameCollision {
                scope: scope.to_string(),
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Builder for [`Extensions`].
#[derive(Default)]
pub struct ExtensionsBuilder {
    params: Vec<(String, Value)>,
    methods: Vec<(String, ExtensionMethod)>,
}

impl ExtensionsBuilder {
    /// Adds a parameter.
    pub fn param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.push((name.into(), value));
        self
    }

    /// Adds a method.
    pub fn method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&Extensions, &[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.methods.push((name.into(), Arc::new(method)));
        self
    }

    /// Builds the extension set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ExtensionNameCollision` if a name is used twice.
    pub fn build(self) -> Result<Extensions, ConfigError> {
        let mut ext = Extensions::default();

        for (name, value) in self.params {
            if ext.params.contains_key(&name) {
                return Err(collision("param", name));
            }
            ext.params.insert(name, value);
        }

        for (name, method) in self.methods {
            if ext.params.contains_key(&name) || ext.methods.contains_key(&name) {
                return Err(collision("method", name));
            }
            ext.methods.insert(name, method);
        }

        Ok(ext)
    }
}

fn collision(scope: &str, name: String) -> ConfigError {
    ConfigError::ExtensionNameCollision {
        scope: scope.to_string(),
        name,
    }
}
