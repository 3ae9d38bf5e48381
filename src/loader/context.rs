//! Isolated code-loading contexts.
//!
//! Every loaded bundle owns exactly one [`CodeContext`]. Whatever the
//! bundle's code pulled in lives inside it and goes away in one step with
//! [`CodeContext::destroy`].
//!
//! Two kinds of entry class are supported:
//!
//! - a Lua script at `<bundle dir>/<class with '.' as '/'>.lua`, run on its
//!   own worker thread ([`LuaComponent`])
//! - a factory registered in a [`ComponentRegistry`] under the class name,
//!   for components compiled into the host binary

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::component::Component;
use crate::error::{Error, Result};
use crate::util::lock;

use super::lua_component::{script_path, LuaComponent};

/// Builds a fresh component instance.
pub type ComponentFactory = Arc<dyn Fn() -> Arc<dyn Component> + Send + Sync>;

/// Entry classes implemented natively, keyed by class name.
///
/// Cloning shares the same table.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: Arc<Mutex<HashMap<String, ComponentFactory>>>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

impl ComponentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `class`, replacing any earlier entry.
    pub fn register<F>(&self, class: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Component> + Send + Sync + 'static,
    {
        lock(&self.factories).insert(class.to_string(), Arc::new(factory));
    }

    /// Whether `class` has a factory.
    pub fn contains(&self, class: &str) -> bool {
        lock(&self.factories).contains_key(class)
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<_> = lock(&self.factories).keys().cloned().collect();
        classes.sort();
        classes
    }

    /// A new instance of `class`.
    pub fn create(&self, class: &str) -> Option<Arc<dyn Component>> {
        // Run the factory outside the lock; it may touch the registry.
        let factory = lock(&self.factories).get(class).cloned();
        factory.map(|make| make())
    }
}

#[derive(Debug)]
enum Runtime {
    Lua(Arc<LuaComponent>),
    Native,
}

/// Code-loading context scoped to one bundle directory.
#[derive(Debug)]
pub struct CodeContext {
    directory: PathBuf,
    class: String,
    runtime: Runtime,
}

impl CodeContext {
    /// Resolve `class` inside `dir` and instantiate it.
    ///
    /// A script in the bundle wins over a registered factory of the same
    /// name.
    ///
    /// # Errors
    ///
    /// [`Error::Load`] if neither a script nor a factory exists, or the
    /// script fails to load.
    pub fn open(
        bundle: &str,
        dir: &Path,
        class: &str,
        registry: &ComponentRegistry,
    ) -> Result<(Self, Arc<dyn Component>)> {
        let script = script_path(dir, class);
        if script.is_file() {
            let lua = LuaComponent::load(bundle, class, dir, &script)?;
            let context = Self {
                directory: dir.to_path_buf(),
                class: class.to_string(),
                runtime: Runtime::Lua(Arc::clone(&lua)),
            };
            let component: Arc<dyn Component> = lua;
            return Ok((context, component));
        }

        if let Some(component) = registry.create(class) {
            let context = Self {
                directory: dir.to_path_buf(),
                class: class.to_string(),
                runtime: Runtime::Native,
            };
            return Ok((context, component));
        }

        Err(Error::Load {
            bundle: bundle.to_string(),
            class: class.to_string(),
            reason: format!(
                "no script at {} and no registered class of that name",
                script.display()
            ),
        })
    }

    /// Bundle directory this context is scoped to.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Entry class the context was opened for.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// `"lua"` or `"native"`.
    pub fn kind(&self) -> &'static str {
        match self.runtime {
            Runtime::Lua(_) => "lua",
            Runtime::Native => "native",
        }
    }

    /// Discard everything loaded through this context.
    pub fn destroy(self) {
        if let Runtime::Lua(component) = &self.runtime {
            component.stop();
        }
        log::debug!(
            "[Loader] Released {} context for {}",
            self.kind(),
            self.directory.display()
        );
    }
}
