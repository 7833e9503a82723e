// SPDX-License-Identifier: MIT OR Apache-2.0
//! Extension discovery and loading, per spec §4.2 ("Extension discovery")
//! and §9's "module provider" design note.
//!
//! Two [`ModuleProvider`] implementations cover the split spec §9 calls
//! for: [`FsModuleProvider`] scans an on-disk root for
//! `extension.manifest.json` files (the "native extension point"), and
//! [`StaticModuleProvider`] registers modules directly from an in-memory
//! list (the "in-memory registered factory", used by tests and by hosts
//! without dynamic loading — this core does not require runtime code
//! loading, so `FsModuleProvider` resolves manifests and compatibility
//! from disk but still takes its handler registration from a
//! statically-linked factory keyed by module name, rather than executing
//! arbitrary code found on disk).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{AgentEventsError, AgentEventsResult};
use crate::manifest::{Capabilities, ExtensionManifest};
use crate::registry::EventRegistry;

/// The conventional events-entrypoint filename used when a manifest does
/// not set `entrypoints.events`.
pub const DEFAULT_EVENTS_ENTRYPOINT: &str = "events.js";

/// One directory `DiscoverModules` found, before it has been loaded.
#[derive(Debug, Clone)]
pub struct ModuleCandidate {
    /// The module's directory-relative name.
    pub name: String,
    /// The module's root directory, if discovered from disk.
    pub root: Option<PathBuf>,
    /// The parsed manifest, if `extension.manifest.json` was present and
    /// valid JSON. A module with no manifest has empty capabilities (and
    /// therefore fails every check under `warn`/`enforced` trust modes).
    pub manifest: Option<ExtensionManifest>,
}

impl ModuleCandidate {
    /// This candidate's effective capabilities (empty if no manifest).
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.manifest
            .as_ref()
            .map(|m| m.capabilities.clone())
            .unwrap_or_default()
    }

    /// Resolve the events entrypoint path: the manifest's
    /// `entrypoints.events` if set, else the conventional default,
    /// relative to `root` (when discovered from disk).
    #[must_use]
    pub fn events_entrypoint(&self) -> String {
        self.manifest
            .as_ref()
            .and_then(|m| m.entrypoints.events.clone())
            .unwrap_or_else(|| DEFAULT_EVENTS_ENTRYPOINT.to_string())
    }
}

/// A module candidate's handler registration, kept separate from
/// [`ModuleCandidate`] so discovery (which may run purely to populate an
/// admin listing) never needs a handler factory in scope.
pub struct LoadedModuleSource {
    /// Populated by invoking the module's `registerAgentEvents`
    /// entrypoint.
    pub registry: EventRegistry,
}

/// Abstracts how candidates are discovered and how their handler
/// registrations are obtained, per spec §9.
#[async_trait]
pub trait ModuleProvider: Send + Sync {
    /// Discover candidates under this provider's configured roots/sources.
    async fn discover(&self) -> AgentEventsResult<Vec<ModuleCandidate>>;

    /// Invoke `candidate`'s `registerAgentEvents(registry)` entrypoint and
    /// return the populated registry.
    async fn load(&self, candidate: &ModuleCandidate) -> AgentEventsResult<LoadedModuleSource>;
}

/// A registration factory for one statically-linked module.
pub type RegisterFn = Arc<dyn Fn(&mut EventRegistry) + Send + Sync>;

/// An in-memory registered-factory provider: modules are supplied directly
/// as `(name, manifest, register_fn)` triples rather than discovered from
/// a filesystem root. Used by tests and by hosts that compile their
/// extensions in rather than loading them dynamically.
#[derive(Default, Clone)]
pub struct StaticModuleProvider {
    modules: Vec<(String, Option<ExtensionManifest>, RegisterFn)>,
}

impl StaticModuleProvider {
    /// An empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one module's manifest and registration factory.
    pub fn register(
        mut self,
        name: impl Into<String>,
        manifest: Option<ExtensionManifest>,
        register: RegisterFn,
    ) -> Self {
        self.modules.push((name.into(), manifest, register));
        self
    }
}

#[async_trait]
impl ModuleProvider for StaticModuleProvider {
    async fn discover(&self) -> AgentEventsResult<Vec<ModuleCandidate>> {
        Ok(self
            .modules
            .iter()
            .map(|(name, manifest, _)| ModuleCandidate {
                name: name.clone(),
                root: None,
                manifest: manifest.clone(),
            })
            .collect())
    }

    async fn load(&self, candidate: &ModuleCandidate) -> AgentEventsResult<LoadedModuleSource> {
        let (_, _, register) = self
            .modules
            .iter()
            .find(|(name, _, _)| name == &candidate.name)
            .ok_or_else(|| AgentEventsError::EntrypointMissing {
                module: candidate.name.clone(),
                reason: "no registered factory for this module name".to_string(),
            })?;
        let mut registry = EventRegistry::new();
        register(&mut registry);
        Ok(LoadedModuleSource { registry })
    }
}

/// Scans an on-disk agents root (plus any additional configured roots) for
/// subdirectories containing `extension.manifest.json`. Actual handler
/// registration is resolved from a statically-linked `factories` map keyed
/// by module name — see the module-level docs for why this core does not
/// execute arbitrary on-disk code.
pub struct FsModuleProvider {
    roots: Vec<PathBuf>,
    factories: HashMap<String, RegisterFn>,
}

impl FsModuleProvider {
    /// A provider scanning `roots` for extension directories, resolving
    /// handler registration from `factories`.
    #[must_use]
    pub fn new(roots: Vec<PathBuf>, factories: HashMap<String, RegisterFn>) -> Self {
        Self { roots, factories }
    }
}

#[async_trait]
impl ModuleProvider for FsModuleProvider {
    async fn discover(&self) -> AgentEventsResult<Vec<ModuleCandidate>> {
        let mut candidates = Vec::new();
        for root in &self.roots {
            let mut entries = match tokio::fs::read_dir(root).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(AgentEventsError::DiscoveryIo {
                        path: root.display().to_string(),
                        source,
                    });
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|source| AgentEventsError::DiscoveryIo {
                    path: root.display().to_string(),
                    source,
                })?
            {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let manifest = read_manifest(&path).await?;
                candidates.push(ModuleCandidate {
                    name,
                    root: Some(path),
                    manifest,
                });
            }
        }
        Ok(candidates)
    }

    async fn load(&self, candidate: &ModuleCandidate) -> AgentEventsResult<LoadedModuleSource> {
        if let Some(root) = &candidate.root {
            let entrypoint = root.join(candidate.events_entrypoint());
            if !entrypoint.exists() {
                return Err(AgentEventsError::EntrypointMissing {
                    module: candidate.name.clone(),
                    reason: format!("{} does not exist", entrypoint.display()),
                });
            }
        }
        let register = self.factories.get(&candidate.name).ok_or_else(|| {
            AgentEventsError::EntrypointMissing {
                module: candidate.name.clone(),
                reason: "no statically-linked factory resolves this module's entrypoint"
                    .to_string(),
            }
        })?;
        let mut registry = EventRegistry::new();
        register(&mut registry);
        Ok(LoadedModuleSource { registry })
    }
}

async fn read_manifest(dir: &Path) -> AgentEventsResult<Option<ExtensionManifest>> {
    let manifest_path = dir.join("extension.manifest.json");
    let bytes = match tokio::fs::read(&manifest_path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(AgentEventsError::DiscoveryIo {
                path: manifest_path.display().to_string(),
                source,
            });
        }
    };
    match serde_json::from_slice::<ExtensionManifest>(&bytes) {
        Ok(m) => Ok(Some(m)),
        Err(e) => {
            warn!(
                target: "abp.agent_events",
                path = %manifest_path.display(),
                error = %e,
                "extension manifest is structurally invalid",
            );
            Err(AgentEventsError::ManifestInvalid {
                module: dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                reason: e.to_string(),
            })
        }
    }
}
