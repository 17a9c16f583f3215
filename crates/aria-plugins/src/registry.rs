//! The plugin registry: registration-time validation, per-user schema
//! assembly, and the invocation path with deadline and panic containment.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rusqlite::Connection;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aria_core::config::PluginsConfig;
use aria_core::types::Tier;

use crate::enablement::EnablementStore;
use crate::error::{PluginError, Result};
use crate::schema::validate_args;
use crate::types::{PluginCall, PluginDescriptor, PluginHandler, ToolOutcome, ToolSchema};

const NAME_MAX_LEN: usize = 50;

struct Registered {
    descriptor: PluginDescriptor,
    handler: Arc<dyn PluginHandler>,
}

/// Read-mostly after boot: registration takes the write lock, every other
/// path takes a read lock. Per-user enablement is copy-on-write in the
/// `EnablementStore`.
pub struct PluginRegistry {
    cfg: PluginsConfig,
    plugins: RwLock<HashMap<String, Arc<Registered>>>,
    /// function name → owning plugin name. Function names are global.
    functions: RwLock<HashMap<String, String>>,
    enablement: EnablementStore,
}

impl PluginRegistry {
    pub fn new(cfg: PluginsConfig, enablement_conn: Connection) -> Self {
        Self {
            cfg,
            plugins: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            enablement: EnablementStore::new(enablement_conn),
        }
    }

    /// Register one plugin. Fails closed on any validation error; the
    /// registry is left unchanged in that case.
    pub fn register(
        &self,
        descriptor: PluginDescriptor,
        handler: Arc<dyn PluginHandler>,
    ) -> Result<()> {
        validate_name(&descriptor.name)?;
        if !self.cfg.whitelist.is_empty() && !self.cfg.whitelist.contains(&descriptor.name) {
            return Err(PluginError::NotWhitelisted {
                name: descriptor.name.clone(),
            });
        }

        let mut plugins = self.plugins.write().unwrap();
        let mut functions = self.functions.write().unwrap();

        if plugins.contains_key(&descriptor.name) {
            return Err(PluginError::DuplicatePlugin {
                name: descriptor.name.clone(),
            });
        }
        for schema in &descriptor.functions {
            if let Some(owner) = functions.get(&schema.name) {
                return Err(PluginError::DuplicateFunction {
                    function: schema.name.clone(),
                    plugin: owner.clone(),
                });
            }
        }

        for schema in &descriptor.functions {
            functions.insert(schema.name.clone(), descriptor.name.clone());
        }
        info!(
            plugin = %descriptor.name,
            functions = descriptor.functions.len(),
            "plugin registered"
        );
        plugins.insert(
            descriptor.name.clone(),
            Arc::new(Registered {
                descriptor,
                handler,
            }),
        );
        Ok(())
    }

    /// Load descriptor manifests (`*.json`) from a directory and attach
    /// handlers from the supplied factory map (keyed by the manifest's
    /// `handler_ref`). Invalid entries are skipped with a structured log,
    /// never a crash.
    pub fn discover_dir(
        &self,
        dir: &Path,
        factories: &HashMap<String, Arc<dyn PluginHandler>>,
    ) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "plugin directory unreadable");
                return 0;
            }
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(self.cfg.load_timeout_s);
        let mut loaded = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            if std::time::Instant::now() > deadline {
                warn!(dir = %dir.display(), loaded, "plugin discovery deadline hit, stopping");
                break;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Symlinked manifests could point outside the plugin directory;
            // only plain files directly inside it are considered.
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                warn!(path = %path.display(), "skipping non-regular plugin manifest");
                continue;
            }
            match self.load_manifest(&path, factories) {
                Ok(name) => {
                    loaded += 1;
                    debug!(plugin = %name, path = %path.display(), "plugin discovered");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "plugin skipped");
                }
            }
        }
        loaded
    }

    fn load_manifest(
        &self,
        path: &Path,
        factories: &HashMap<String, Arc<dyn PluginHandler>>,
    ) -> Result<String> {
        let meta = std::fs::metadata(path).map_err(|e| PluginError::LoadFailure {
            reason: format!("stat failed: {e}"),
        })?;
        if meta.len() > self.cfg.max_file_size_bytes {
            return Err(PluginError::LoadFailure {
                reason: format!(
                    "manifest is {} bytes, cap is {}",
                    meta.len(),
                    self.cfg.max_file_size_bytes
                ),
            });
        }

        let raw = std::fs::read_to_string(path).map_err(|e| PluginError::LoadFailure {
            reason: format!("read failed: {e}"),
        })?;
        let manifest: Manifest =
            serde_json::from_str(&raw).map_err(|e| PluginError::LoadFailure {
                reason: format!("manifest parse failed: {e}"),
            })?;

        let handler = factories
            .get(&manifest.handler_ref)
            .cloned()
            .ok_or_else(|| PluginError::LoadFailure {
                reason: format!("no handler for ref '{}'", manifest.handler_ref),
            })?;

        let name = manifest.descriptor.name.clone();
        self.register(manifest.descriptor, handler)?;
        Ok(name)
    }

    /// All registered descriptors, name-sorted.
    pub fn discover(&self) -> Vec<PluginDescriptor> {
        let plugins = self.plugins.read().unwrap();
        let mut out: Vec<PluginDescriptor> =
            plugins.values().map(|p| p.descriptor.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn enable(&self, user_id: &str, plugin: &str) -> Result<()> {
        self.require_plugin(plugin)?;
        self.enablement.set(user_id, plugin, true)
    }

    pub fn disable(&self, user_id: &str, plugin: &str) -> Result<()> {
        self.require_plugin(plugin)?;
        self.enablement.set(user_id, plugin, false)
    }

    /// Whether a plugin is on for a user, combining the explicit toggle
    /// with the descriptor default.
    pub fn is_enabled(&self, user_id: &str, plugin: &str) -> Result<bool> {
        let registered = self.require_plugin(plugin)?;
        let toggles = self.enablement.toggles(user_id)?;
        Ok(*toggles
            .get(plugin)
            .unwrap_or(&registered.descriptor.default_enabled))
    }

    /// Tool schemas offered to the LLM on this user's turn: enabled
    /// plugins only, filtered by tier gating.
    pub fn schemas_for(&self, user_id: &str, tier: Tier) -> Result<Vec<ToolSchema>> {
        let toggles = self.enablement.toggles(user_id)?;
        let plugins = self.plugins.read().unwrap();

        let mut names: Vec<&String> = plugins.keys().collect();
        names.sort();

        let mut out = Vec::new();
        for name in names {
            let registered = &plugins[name];
            let desc = &registered.descriptor;
            if desc.tier_required > tier {
                continue;
            }
            let enabled = *toggles.get(name).unwrap_or(&desc.default_enabled);
            if !enabled {
                continue;
            }
            for schema in &desc.functions {
                out.push(ToolSchema {
                    name: schema.name.clone(),
                    description: schema.description.clone(),
                    input_schema: schema.input_schema(),
                });
            }
        }
        Ok(out)
    }

    /// Invoke a function by name on behalf of a user.
    ///
    /// Gating (enablement + tier) is enforced here as well, so a client
    /// that names a premium function directly still gets rejected. The
    /// handler runs on its own task with a deadline; panics become
    /// `ToolFailed`, deadline overruns become `ToolTimeout`.
    pub async fn invoke(
        &self,
        user_id: &str,
        session_id: &str,
        tier: Tier,
        function: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolOutcome> {
        let (registered, schema) = {
            let functions = self.functions.read().unwrap();
            let plugin_name =
                functions
                    .get(function)
                    .cloned()
                    .ok_or_else(|| PluginError::UnknownFunction {
                        function: function.to_string(),
                    })?;
            drop(functions);

            let plugins = self.plugins.read().unwrap();
            let registered = plugins
                .get(&plugin_name)
                .cloned()
                .ok_or(PluginError::NotFound { name: plugin_name })?;
            let schema = registered
                .descriptor
                .functions
                .iter()
                .find(|f| f.name == function)
                .cloned()
                .ok_or_else(|| PluginError::UnknownFunction {
                    function: function.to_string(),
                })?;
            (registered, schema)
        };

        let desc = &registered.descriptor;
        if desc.tier_required > tier {
            return Err(PluginError::PremiumRequired {
                plugin: desc.name.clone(),
            });
        }
        if !self.is_enabled(user_id, &desc.name)? {
            return Err(PluginError::NotEnabled {
                plugin: desc.name.clone(),
            });
        }

        validate_args(&schema, &args).map_err(|detail| PluginError::InvalidToolArguments {
            function: function.to_string(),
            detail,
        })?;

        let call = PluginCall {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            function: function.to_string(),
            args,
            cancel: cancel.clone(),
        };

        let handler = registered.handler.clone();
        let task = tokio::spawn(async move { handler.call(call).await });
        let deadline = Duration::from_secs(self.cfg.timeout_s);

        let joined = tokio::select! {
            joined = tokio::time::timeout(deadline, task) => joined,
            _ = cancel.cancelled() => return Err(PluginError::Cancelled),
        };

        match joined {
            Err(_elapsed) => Err(PluginError::ToolTimeout {
                function: function.to_string(),
                timeout_s: self.cfg.timeout_s,
            }),
            Ok(Err(join_err)) => Err(PluginError::ToolFailed {
                plugin: desc.name.clone(),
                name: function.to_string(),
                message: if join_err.is_panic() {
                    "handler panicked".to_string()
                } else {
                    join_err.to_string()
                },
            }),
            Ok(Ok(Err(message))) => Err(PluginError::ToolFailed {
                plugin: desc.name.clone(),
                name: function.to_string(),
                message,
            }),
            Ok(Ok(Ok(outcome))) => Ok(outcome),
        }
    }

    fn require_plugin(&self, name: &str) -> Result<Arc<Registered>> {
        let plugins = self.plugins.read().unwrap();
        plugins
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound {
                name: name.to_string(),
            })
    }
}

/// On-disk manifest: a descriptor plus the handler it binds to.
#[derive(serde::Deserialize)]
struct Manifest {
    handler_ref: String,
    #[serde(flatten)]
    descriptor: PluginDescriptor,
}

/// Plugin names: `[A-Za-z0-9_-]{1,50}`, no path separators possible.
fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= NAME_MAX_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(PluginError::InvalidName {
            name: name.to_string(),
        })
    }
}
