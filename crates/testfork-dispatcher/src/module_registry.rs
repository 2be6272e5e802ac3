// Resolves named worker implementation modules to classpath entries.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use testfork_common::DispatcherSettings;
use testfork_sdk::ClassPath;

/// A named module and the code locations that implement it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub implementation_classpath: ClassPath,
}

pub trait ModuleRegistry: Send + Sync {
    fn module(&self, name: &str) -> Result<Module>;
}

/// Registry backed by the `modules` table of [`DispatcherSettings`]. Modules
/// missing from the table resolve to the install directory, if one is set.
#[derive(Debug, Clone, Default)]
pub struct StaticModuleRegistry {
    modules: BTreeMap<String, ClassPath>,
    install_dir: Option<PathBuf>,
}

impl StaticModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &DispatcherSettings) -> Self {
        let modules = settings
            .modules
            .iter()
            .map(|(name, entries)| (name.clone(), entries.iter().cloned().collect()))
            .collect();
        Self {
            modules,
            install_dir: None,
        }
    }

    /// Directory that provides any module not listed explicitly.
    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    pub fn register<P: Into<PathBuf>>(
        &mut self,
        name: impl Into<String>,
        entries: impl IntoIterator<Item = P>,
    ) -> &mut Self {
        self.modules
            .insert(name.into(), entries.into_iter().collect());
        self
    }
}

impl ModuleRegistry for StaticModuleRegistry {
    fn module(&self, name: &str) -> Result<Module> {
        let implementation_classpath = match (self.modules.get(name), &self.install_dir) {
            (Some(classpath), _) => classpath.clone(),
            (None, Some(dir)) => [dir.clone()].into_iter().collect(),
            (None, None) => anyhow::bail!(
                "Cannot locate module '{name}'. Add it to the 'modules' section of the settings file."
            ),
        };
        Ok(Module {
            name: name.to_string(),
            implementation_classpath,
        })
    }
}
