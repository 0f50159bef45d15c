//! # Backend Registry
//!
//! Builds backends from configuration data.
//!
//! A [`BackendConfig`] names a backend and carries its options; options
//! that are themselves backends are nested configs. The registry is built
//! once and handed explicitly to whoever constructs backends; it has no
//! global state and does not change after [`build`](BackendRegistryBuilder::build).
//!
//! Transports cannot be described in JSON, so a `WorkerFS` config names an
//! endpoint registered on the builder with
//! [`endpoint`](BackendRegistryBuilder::endpoint), and each build opens a
//! fresh connection through it.
//!
//! ```rust
//! use layerfs::registry::{BackendConfig, BackendRegistry};
//! use layerfs::FsAsync;
//! use std::path::Path;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> layerfs::FsResult<()> {
//! let registry = BackendRegistry::standard();
//! let config = BackendConfig::from_json(
//!     r#"{
//!         "backend": "OverlayFS",
//!         "options": {
//!             "upper": {"backend": "InMemory"},
//!             "lower": {"backend": "ReadOnly", "options": {"inner": {"backend": "InMemory"}}}
//!         }
//!     }"#,
//! )?;
//! let fs = registry.build(&config).await?;
//! fs.write_file(Path::new("/a"), b"x", 0o644).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rpc::{RpcClient, Transport};
use crate::{AsyncMirror, FileSystem, FsError, FsResult, MemoryFs, OverlayFs, ReadOnly};

/// Declarative description of a backend to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Registered backend name.
    pub backend: String,
    /// Option values by name.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl BackendConfig {
    /// A config with no options.
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            options: serde_json::Map::new(),
        }
    }

    /// Add an option whose value is a nested backend.
    pub fn with_backend(mut self, name: impl Into<String>, config: BackendConfig) -> Self {
        let value = serde_json::to_value(config).unwrap_or(serde_json::Value::Null);
        self.options.insert(name.into(), value);
        self
    }

    /// Add a plain option value.
    pub fn with_value(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(name.into(), value);
        self
    }

    /// Parse a config from JSON text.
    ///
    /// # Errors
    ///
    /// - [`FsError::InvalidArgument`] if the text is not a valid config
    pub fn from_json(text: &str) -> FsResult<Self> {
        serde_json::from_str(text).map_err(|e| FsError::invalid(format!("backend config: {e}")))
    }
}

/// What an option's value holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// A nested [`BackendConfig`].
    Backend,
    /// Any other JSON value.
    Value,
}

/// Schema for one backend option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionSpec {
    /// Option name.
    pub name: &'static str,
    /// Whether a config must supply it.
    pub required: bool,
    /// What its value holds.
    pub kind: OptionKind,
    /// Human-readable description.
    pub description: &'static str,
}

/// Future returned by a [`Constructor`].
pub type Built<'a> = BoxFuture<'a, FsResult<Arc<dyn FileSystem>>>;

/// Builds one backend from validated options.
pub type Constructor = for<'a> fn(&'a BackendRegistry, BackendOptions) -> Built<'a>;

/// A named backend constructor with its option schema.
#[derive(Clone)]
pub struct BackendEntry {
    /// Name used in [`BackendConfig::backend`].
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Accepted options.
    pub options: &'static [OptionSpec],
    /// Constructor, called after the options pass validation.
    pub construct: Constructor,
}

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEntry")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Validated option values handed to a [`Constructor`].
#[derive(Debug)]
pub struct BackendOptions {
    backend: &'static str,
    values: serde_json::Map<String, serde_json::Value>,
}

impl BackendOptions {
    /// Build the nested backend under `name`.
    ///
    /// # Errors
    ///
    /// - [`FsError::InvalidArgument`] if the option is absent or not a config
    /// - any error from building the nested backend
    pub async fn backend(
        &self,
        registry: &BackendRegistry,
        name: &str,
    ) -> FsResult<Arc<dyn FileSystem>> {
        let value = self.values.get(name).ok_or_else(|| {
            FsError::invalid(format!("{}: missing option {name:?}", self.backend))
        })?;
        let config: BackendConfig = serde_json::from_value(value.clone()).map_err(|e| {
            FsError::invalid(format!("{}: option {name:?}: {e}", self.backend))
        })?;
        registry.build(&config).await
    }

    /// Deserialize the plain value under `name`, if present.
    ///
    /// # Errors
    ///
    /// - [`FsError::InvalidArgument`] if the value has the wrong shape
    pub fn value<T: DeserializeOwned>(&self, name: &str) -> FsResult<Option<T>> {
        self.values
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    FsError::invalid(format!("{}: option {name:?}: {e}", self.backend))
                })
            })
            .transpose()
    }
}

/// Opens a new connection to an [`RpcServer`](crate::rpc::RpcServer).
pub type TransportFactory = Arc<dyn Fn() -> Transport + Send + Sync>;

/// Immutable table of backend constructors.
#[derive(Clone)]
pub struct BackendRegistry {
    entries: BTreeMap<&'static str, BackendEntry>,
    endpoints: BTreeMap<String, TransportFactory>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("endpoints", &self.endpoints.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Collects entries for a [`BackendRegistry`].
#[derive(Default)]
pub struct BackendRegistryBuilder {
    entries: BTreeMap<&'static str, BackendEntry>,
    endpoints: BTreeMap<String, TransportFactory>,
}

impl BackendRegistryBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder preloaded with the standard backends.
    pub fn standard() -> Self {
        Self::new()
            .register(IN_MEMORY)
            .register(OVERLAY)
            .register(MIRROR)
            .register(READ_ONLY)
            .register(WORKER)
    }

    /// Add an entry, replacing any entry with the same name.
    pub fn register(mut self, entry: BackendEntry) -> Self {
        self.entries.insert(entry.name, entry);
        self
    }

    /// Name a way to reach a server, for `WorkerFS` configs to refer to.
    /// Replaces any endpoint with the same name.
    pub fn endpoint(
        mut self,
        name: impl Into<String>,
        connect: impl Fn() -> Transport + Send + Sync + 'static,
    ) -> Self {
        self.endpoints.insert(name.into(), Arc::new(connect));
        self
    }

    /// Freeze the table.
    pub fn build(self) -> BackendRegistry {
        BackendRegistry {
            entries: self.entries,
            endpoints: self.endpoints,
        }
    }
}

impl BackendRegistry {
    /// Start an empty builder.
    pub fn builder() -> BackendRegistryBuilder {
        BackendRegistryBuilder::new()
    }

    /// `InMemory`, `OverlayFS`, `AsyncMirror`, `ReadOnly` and `WorkerFS`,
    /// with no endpoints.
    pub fn standard() -> Self {
        BackendRegistryBuilder::standard().build()
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&BackendEntry> {
        self.entries.get(name)
    }

    /// All entries, sorted by name.
    pub fn entries(&self) -> impl Iterator<Item = &BackendEntry> {
        self.entries.values()
    }

    /// Validate `config` against its entry's schema and build it.
    ///
    /// # Errors
    ///
    /// - [`FsError::InvalidArgument`] for an unknown backend, an unknown
    ///   option, or a missing required option
    /// - any error from the backend's constructor
    pub fn build<'a>(&'a self, config: &BackendConfig) -> Built<'a> {
        let checked = self.check(config);
        Box::pin(async move {
            let (entry, options) = checked?;
            debug!(backend = entry.name, "building backend");
            (entry.construct)(self, options).await
        })
    }

    fn check(&self, config: &BackendConfig) -> FsResult<(&BackendEntry, BackendOptions)> {
        let entry = self
            .get(&config.backend)
            .ok_or_else(|| FsError::invalid(format!("unknown backend {:?}", config.backend)))?;
        if let Some(unknown) = config
            .options
            .keys()
            .find(|key| !entry.options.iter().any(|spec| spec.name == key.as_str()))
        {
            return Err(FsError::invalid(format!(
                "{}: unknown option {unknown:?}",
                entry.name
            )));
        }
        if let Some(missing) = entry
            .options
            .iter()
            .find(|spec| spec.required && !config.options.contains_key(spec.name))
        {
            return Err(FsError::invalid(format!(
                "{}: missing required option {:?}",
                entry.name, missing.name
            )));
        }
        Ok((
            entry,
            BackendOptions {
                backend: entry.name,
                values: config.options.clone(),
            },
        ))
    }
}

/// Open a connection through the endpoint registered as `name`.
fn open_endpoint(registry: &BackendRegistry, name: &str) -> FsResult<Transport> {
    registry
        .endpoints
        .get(name)
        .map(|factory| factory())
        .ok_or_else(|| FsError::invalid(format!("WorkerFS: unknown endpoint {name:?}")))
}

const fn backend_option(name: &'static str, description: &'static str) -> OptionSpec {
    OptionSpec {
        name,
        required: true,
        kind: OptionKind::Backend,
        description,
    }
}

const IN_MEMORY: BackendEntry = BackendEntry {
    name: "InMemory",
    description: "Volatile in-process storage",
    options: &[],
    construct: build_in_memory,
};

const OVERLAY: BackendEntry = BackendEntry {
    name: "OverlayFS",
    description: "Writable upper layer over a lower layer",
    options: &[
        backend_option("upper", "Writable layer receiving every change"),
        backend_option("lower", "Layer never modified by the overlay"),
    ],
    construct: build_overlay,
};

const MIRROR: BackendEntry = BackendEntry {
    name: "AsyncMirror",
    description: "Synchronous local replica of an asynchronous store",
    options: &[
        backend_option("sync", "Synchronous local replica"),
        backend_option("async", "Remote store the replica follows"),
    ],
    construct: build_mirror,
};

const READ_ONLY: BackendEntry = BackendEntry {
    name: "ReadOnly",
    description: "Rejects every mutation of the wrapped backend",
    options: &[backend_option("inner", "Backend to protect")],
    construct: build_read_only,
};

const WORKER: BackendEntry = BackendEntry {
    name: "WorkerFS",
    description: "Remote backend reached over an RPC transport",
    options: &[OptionSpec {
        name: "endpoint",
        required: true,
        kind: OptionKind::Value,
        description: "Name of an endpoint registered on the builder",
    }],
    construct: build_worker,
};

fn build_in_memory(_: &BackendRegistry, _: BackendOptions) -> Built<'_> {
    Box::pin(async { Ok(Arc::new(MemoryFs::new()) as Arc<dyn FileSystem>) })
}

fn build_overlay(registry: &BackendRegistry, options: BackendOptions) -> Built<'_> {
    Box::pin(async move {
        let upper = options.backend(registry, "upper").await?;
        let lower = options.backend(registry, "lower").await?;
        let overlay = OverlayFs::new(upper, lower).await?;
        Ok(Arc::new(overlay) as Arc<dyn FileSystem>)
    })
}

fn build_mirror(registry: &BackendRegistry, options: BackendOptions) -> Built<'_> {
    Box::pin(async move {
        let local = options.backend(registry, "sync").await?;
        let remote = options.backend(registry, "async").await?;
        let mirror = AsyncMirror::synced(local, remote).await?;
        Ok(Arc::new(mirror) as Arc<dyn FileSystem>)
    })
}

fn build_read_only(registry: &BackendRegistry, options: BackendOptions) -> Built<'_> {
    Box::pin(async move {
        let inner = options.backend(registry, "inner").await?;
        Ok(Arc::new(ReadOnly::new(inner)) as Arc<dyn FileSystem>)
    })
}

fn build_worker(registry: &BackendRegistry, options: BackendOptions) -> Built<'_> {
    Box::pin(async move {
        let endpoint: String = options
            .value("endpoint")?
            .ok_or_else(|| FsError::invalid("WorkerFS: missing option \"endpoint\""))?;
        let client = RpcClient::connect(open_endpoint(registry, &endpoint)?).await?;
        debug!(endpoint = %endpoint, "connected worker backend");
        Ok(Arc::new(client) as Arc<dyn FileSystem>)
    })
}
