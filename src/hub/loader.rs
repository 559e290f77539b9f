//! Module Loader Bridge
//!
//! Turns a manifest into a [`GameFactory`] exposing one `init` contract for
//! both runtime kinds.
//!
//! ```text
//! Runtime::IframeHtml(entryUrl)      -> nothing fetched, the URL is handed to an
//!                                       isolated browsing context
//! Runtime::EsmModule(pipeline)       -> entry -> adapter -> ui-runtime -> component
//!                                       each stage fetched from its own endpoint,
//!                                       each under its own timeout
//! ```
//!
//! A failed stage aborts resolution before any launch state exists: the
//! caller only issues a credential once a factory has been produced.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::hub::instance::{
    ContainerError, GameContainer, GameInstance, IframeInstance, LaunchContext, ModuleInstance,
    ModulePort,
};
use crate::hub::control::{HostLink, Transport};
use crate::hub::manifest::{GameManifest, RuntimeKind};

/// Default per-stage timeout.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// STAGES & FAILURES
// =============================================================================

/// Named resolution stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    /// Entry module, re-exports the adapter.
    Entry,
    /// Adapter module, dynamically imports runtime then component.
    Adapter,
    /// Pinned external UI runtime.
    UiRuntime,
    /// Concrete game component (adapter bundle).
    Component,
}

impl StageName {
    /// Stages in resolution order.
    pub const ORDER: [StageName; 4] = [
        StageName::Entry,
        StageName::Adapter,
        StageName::UiRuntime,
        StageName::Component,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Entry => "entry",
            StageName::Adapter => "adapter",
            StageName::UiRuntime => "ui-runtime",
            StageName::Component => "component",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadCause {
    /// Stage did not finish within its timeout.
    #[error("timeout")]
    Timeout,
    /// Transport-level failure.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// Endpoint answered with a non-success status.
    #[error("unexpected status {0}")]
    Status(u16),
    /// Endpoint answered with an empty module.
    #[error("empty module")]
    Empty,
    /// Module does not reference the next stage.
    #[error("missing import: {0}")]
    MissingImport(String),
    /// Adapter imports a runtime other than the pinned one.
    #[error("unpinned runtime dependency: {0}")]
    UnpinnedDependency(String),
}

/// Loader errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// A resolution stage failed. Nothing was created.
    #[error("module load failed at stage {stage}: {cause}")]
    ModuleLoadFailure {
        /// Failing stage.
        stage: StageName,
        /// Failure cause.
        cause: LoadCause,
    },
}

impl LoadError {
    /// Failing stage.
    pub fn stage(&self) -> StageName {
        match self {
            LoadError::ModuleLoadFailure { stage, .. } => *stage,
        }
    }

    /// Whether the failure was a stage timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LoadError::ModuleLoadFailure { cause: LoadCause::Timeout, .. })
    }
}

// =============================================================================
// FETCHING
// =============================================================================

/// A fetched module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    /// Absolute URL the module was fetched from.
    pub url: String,
    /// Module text.
    pub body: String,
}

/// Boxed fetch future.
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<ModuleSource, LoadCause>> + Send + 'a>>;

/// Fetches one module by absolute URL.
pub trait ModuleFetcher: Send + Sync {
    /// Fetch the module at `url`.
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a>;
}

/// HTTP fetcher.
#[derive(Debug, Clone, Default)]
pub struct HttpModuleFetcher {
    client: reqwest::Client,
}

impl HttpModuleFetcher {
    /// Creates a fetcher with the given HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ModuleFetcher for HttpModuleFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| LoadCause::Fetch(e.to_string()))?;

            if !response.status().is_success() {
                return Err(LoadCause::Status(response.status().as_u16()));
            }

            let body = response
                .text()
                .await
                .map_err(|e| LoadCause::Fetch(e.to_string()))?;

            Ok(ModuleSource { url: url.to_string(), body })
        })
    }
}

/// In-memory fetcher with optional per-URL latency.
#[derive(Debug, Clone, Default)]
pub struct StaticModuleFetcher {
    modules: BTreeMap<String, String>,
    delays: BTreeMap<String, Duration>,
}

impl StaticModuleFetcher {
    /// Empty fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` at `url`.
    pub fn with_module(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.modules.insert(url.into(), body.into());
        self
    }

    /// Delay responses for `url`.
    pub fn with_delay(mut self, url: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(url.into(), delay);
        self
    }
}

impl ModuleFetcher for StaticModuleFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            if let Some(delay) = self.delays.get(url) {
                tokio::time::sleep(*delay).await;
            }
            match self.modules.get(url) {
                Some(body) => Ok(ModuleSource { url: url.to_string(), body: body.clone() }),
                None => Err(LoadCause::Status(404)),
            }
        })
    }
}

// =============================================================================
// SPECIFIER EXTRACTION
// =============================================================================

fn reexport_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"export\s+(?:\*|\{[^}]*\})\s+from\s+["']([^"']+)["']"#)
            .expect("static pattern is valid")
    })
}

fn dynamic_import_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"import\(\s*["']([^"']+)["']\s*\)"#)
            .expect("static pattern is valid")
    })
}

/// First `export ... from "<url>"` target.
pub fn reexport_target(body: &str) -> Option<String> {
    reexport_pattern()
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `import("<url>")` targets in source order.
pub fn dynamic_imports(body: &str) -> Vec<String> {
    dynamic_import_pattern()
        .captures_iter(body)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Module-chain resolution plan for one game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionPipeline {
    /// Absolute URL of the entry stage.
    pub entry_url: String,
    /// Pinned UI runtime the adapter must import, if enforced.
    pub pinned_runtime: Option<String>,
    /// Independent timeout for each stage.
    pub stage_timeout: Duration,
}

/// Runtime tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    /// Isolated document at `entry_url`.
    IframeHtml {
        /// Document URL.
        entry_url: String,
    },
    /// Module chain resolved by the pipeline.
    EsmModule(ResolutionPipeline),
}

impl Runtime {
    /// Runtime kind tag.
    pub fn kind(&self) -> RuntimeKind {
        match self {
            Runtime::IframeHtml { .. } => RuntimeKind::IframeHtml,
            Runtime::EsmModule(_) => RuntimeKind::EsmModule,
        }
    }
}

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Absolute base URL the module endpoints are served from.
    pub public_url: String,
    /// Pinned UI runtime module URL.
    pub ui_runtime_url: Option<String>,
    /// Independent timeout for each stage.
    pub stage_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            public_url: "http://localhost:8080".to_string(),
            ui_runtime_url: None,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }
}

impl LoaderConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            public_url: std::env::var("HUB_PUBLIC_URL").unwrap_or(defaults.public_url),
            ui_runtime_url: std::env::var("HUB_UI_RUNTIME_URL").ok(),
            stage_timeout: std::env::var("HUB_STAGE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.stage_timeout),
        }
    }

    /// Absolute URL of one module endpoint for a game.
    pub fn module_url(&self, game_id: &str, hop: &str) -> String {
        format!("{}/games/{}/module/{}", self.public_url.trim_end_matches('/'), game_id, hop)
    }
}

/// Everything a module chain resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// Entry stage.
    pub entry: ModuleSource,
    /// Adapter stage.
    pub adapter: ModuleSource,
    /// UI runtime stage.
    pub ui_runtime: ModuleSource,
    /// Component stage.
    pub component: ModuleSource,
}

/// Run one stage under its own timeout and tag any failure with its name.
pub async fn run_stage<T, F>(stage: StageName, limit: Duration, work: F) -> Result<T, LoadError>
where
    F: Future<Output = Result<T, LoadCause>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(Ok(value)) => {
            debug!(%stage, "stage resolved");
            Ok(value)
        }
        Ok(Err(cause)) => Err(LoadError::ModuleLoadFailure { stage, cause }),
        Err(_) => Err(LoadError::ModuleLoadFailure { stage, cause: LoadCause::Timeout }),
    }
}

async fn fetch_nonempty(fetcher: &dyn ModuleFetcher, url: &str) -> Result<ModuleSource, LoadCause> {
    let source = fetcher.fetch(url).await?;
    if source.body.trim().is_empty() {
        return Err(LoadCause::Empty);
    }
    Ok(source)
}

/// Capabilities accumulated while walking the stages.
#[derive(Default)]
struct Resolution {
    entry: Option<ModuleSource>,
    adapter_url: Option<String>,
    adapter: Option<ModuleSource>,
    runtime_url: Option<String>,
    component_url: Option<String>,
    ui_runtime: Option<ModuleSource>,
    component: Option<ModuleSource>,
}

impl ResolutionPipeline {
    /// Walk every stage in order. The first failure aborts.
    pub async fn resolve(&self, fetcher: &dyn ModuleFetcher) -> Result<ResolvedModule, LoadError> {
        let mut state = Resolution::default();
        let limit = self.stage_timeout;

        for stage in StageName::ORDER {
            match stage {
                StageName::Entry => {
                    let entry = run_stage(stage, limit, async {
                        let source = fetch_nonempty(fetcher, &self.entry_url).await?;
                        let next = reexport_target(&source.body)
                            .ok_or_else(|| LoadCause::MissingImport("adapter re-export".into()))?;
                        Ok::<_, LoadCause>((source, next))
                    })
                    .await?;
                    state.adapter_url = Some(entry.1);
                    state.entry = Some(entry.0);
                }
                StageName::Adapter => {
                    let url = state.adapter_url.clone().unwrap_or_default();
                    let pinned = self.pinned_runtime.as_deref();
                    let (source, runtime_url, component_url) = run_stage(stage, limit, async {
                        let source = fetch_nonempty(fetcher, &url).await?;
                        let mut imports = dynamic_imports(&source.body).into_iter();
                        let runtime = imports
                            .next()
                            .ok_or_else(|| LoadCause::MissingImport("ui runtime import".into()))?;
                        let component = imports
                            .next()
                            .ok_or_else(|| LoadCause::MissingImport("component import".into()))?;
                        if let Some(pinned) = pinned {
                            if runtime != pinned {
                                return Err(LoadCause::UnpinnedDependency(runtime));
                            }
                        }
                        Ok::<_, LoadCause>((source, runtime, component))
                    })
                    .await?;
                    state.adapter = Some(source);
                    state.runtime_url = Some(runtime_url);
                    state.component_url = Some(component_url);
                }
                StageName::UiRuntime => {
                    let url = state.runtime_url.clone().unwrap_or_default();
                    state.ui_runtime =
                        Some(run_stage(stage, limit, fetch_nonempty(fetcher, &url)).await?);
                }
                StageName::Component => {
                    let url = state.component_url.clone().unwrap_or_default();
                    state.component =
                        Some(run_stage(stage, limit, fetch_nonempty(fetcher, &url)).await?);
                }
            }
        }

        match (state.entry, state.adapter, state.ui_runtime, state.component) {
            (Some(entry), Some(adapter), Some(ui_runtime), Some(component)) => Ok(ResolvedModule {
                entry,
                adapter,
                ui_runtime,
                component,
            }),
            _ => Err(LoadError::ModuleLoadFailure {
                stage: StageName::Component,
                cause: LoadCause::MissingImport("incomplete resolution".into()),
            }),
        }
    }
}

// =============================================================================
// LOADER & FACTORY
// =============================================================================

/// Something that can create a [`GameInstance`] inside a container.
#[derive(Debug, Clone)]
pub enum GameFactory {
    /// Isolated document.
    Iframe {
        /// Document URL.
        entry_url: String,
    },
    /// Resolved module chain.
    Module(Arc<ResolvedModule>),
}

/// Result of `init`.
#[derive(Debug)]
pub struct Mounted {
    /// How the host talks to this instance.
    pub transport: Transport,
    /// Module-side port, for in-process module instances.
    pub module_port: Option<ModulePort>,
}

impl GameFactory {
    /// Runtime kind of instances this factory creates.
    pub fn kind(&self) -> RuntimeKind {
        match self {
            GameFactory::Iframe { .. } => RuntimeKind::IframeHtml,
            GameFactory::Module(_) => RuntimeKind::EsmModule,
        }
    }

    /// Create the game instance inside `container`.
    ///
    /// Fails without side effects if the container already holds a live
    /// instance; the previous one must be destroyed first.
    pub fn init(
        &self,
        container: &mut GameContainer,
        context: &LaunchContext,
        host: &HostLink,
    ) -> Result<Mounted, ContainerError> {
        if container.is_occupied() {
            return Err(ContainerError::Occupied(container.id().to_string()));
        }

        match self {
            GameFactory::Iframe { entry_url } => {
                let window = container.open_window();
                let instance = IframeInstance::new(window, context.document_url(entry_url), host.posted.clone());
                container.mount(Box::new(instance) as Box<dyn GameInstance>)?;
                Ok(Mounted { transport: Transport::Iframe { window }, module_port: None })
            }
            GameFactory::Module(module) => {
                let (instance, port) = ModuleInstance::new(module.clone(), context.clone());
                container.mount(Box::new(instance) as Box<dyn GameInstance>)?;
                Ok(Mounted { transport: Transport::Module, module_port: Some(port) })
            }
        }
    }
}

/// Resolves manifests into factories.
pub struct ModuleLoader {
    fetcher: Arc<dyn ModuleFetcher>,
    config: LoaderConfig,
}

impl ModuleLoader {
    /// Create a loader.
    pub fn new(fetcher: Arc<dyn ModuleFetcher>, config: LoaderConfig) -> Self {
        Self { fetcher, config }
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Runtime plan for a manifest.
    pub fn runtime_for(&self, manifest: &GameManifest) -> Runtime {
        match manifest.runtime {
            RuntimeKind::IframeHtml => Runtime::IframeHtml { entry_url: manifest.entry_url.clone() },
            RuntimeKind::EsmModule => Runtime::EsmModule(ResolutionPipeline {
                entry_url: self.config.module_url(&manifest.id, "entry"),
                pinned_runtime: self.config.ui_runtime_url.clone(),
                stage_timeout: self.config.stage_timeout,
            }),
        }
    }

    /// Resolve a runtime into a factory.
    pub async fn load(&self, runtime: &Runtime) -> Result<GameFactory, LoadError> {
        match runtime {
            Runtime::IframeHtml { entry_url } => Ok(GameFactory::Iframe { entry_url: entry_url.clone() }),
            Runtime::EsmModule(pipeline) => match pipeline.resolve(self.fetcher.as_ref()).await {
                Ok(module) => Ok(GameFactory::Module(Arc::new(module))),
                Err(err) => {
                    warn!(entry = %pipeline.entry_url, stage = %err.stage(), error = %err, "module resolution failed");
                    Err(err)
                }
            },
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
