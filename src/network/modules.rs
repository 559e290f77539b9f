//! Module endpoints for `esm-module` games.
//!
//! Three hops, each served from its own URL so a failure is attributable
//! and each hop caches independently:
//!
//! ```text
//! /games/{id}/module/entry           re-exports the adapter
//! /games/{id}/module/adapter         imports the pinned UI runtime, then the bundle
//! /games/{id}/module/adapter-bundle  re-exports the game component
//! ```
//!
//! Every specifier is an absolute URL so the browser resolver can fetch
//! stages across origins.

use std::fmt;
use std::str::FromStr;

use crate::hub::loader::LoaderConfig;
use crate::hub::manifest::{GameManifest, RuntimeKind};

/// UI runtime imported by adapters when no pin is configured.
pub const DEFAULT_UI_RUNTIME_URL: &str = "https://esm.sh/react@18.2.0";

/// Cache policy for every hop.
pub const MODULE_CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate";

/// Module content type.
pub const MODULE_CONTENT_TYPE: &str = "text/javascript";

/// One hop of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleHop {
    /// Entry module.
    Entry,
    /// Adapter module.
    Adapter,
    /// Component bundle.
    AdapterBundle,
}

impl ModuleHop {
    /// URL segment.
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleHop::Entry => "entry",
            ModuleHop::Adapter => "adapter",
            ModuleHop::AdapterBundle => "adapter-bundle",
        }
    }
}

impl fmt::Display for ModuleHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleHop {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(ModuleHop::Entry),
            "adapter" => Ok(ModuleHop::Adapter),
            "adapter-bundle" => Ok(ModuleHop::AdapterBundle),
            other => Err(ModuleError::UnknownHop(other.to_string())),
        }
    }
}

/// Module endpoint errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleError {
    /// Game is not an `esm-module` game.
    #[error("game {0} is not an esm-module game")]
    NotModule(String),

    /// No such hop.
    #[error("unknown module hop: {0}")]
    UnknownHop(String),
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Render one hop for a manifest.
pub fn render_module(manifest: &GameManifest, hop: ModuleHop, config: &LoaderConfig) -> Result<String, ModuleError> {
    if manifest.runtime != RuntimeKind::EsmModule {
        return Err(ModuleError::NotModule(manifest.id.clone()));
    }

    let source = match hop {
        ModuleHop::Entry => {
            let adapter = js_string(&config.module_url(&manifest.id, ModuleHop::Adapter.as_str()));
            format!("export * from {adapter};\nexport {{ default }} from {adapter};\n")
        }
        ModuleHop::Adapter => {
            let runtime = js_string(config.ui_runtime_url.as_deref().unwrap_or(DEFAULT_UI_RUNTIME_URL));
            let bundle = js_string(&config.module_url(&manifest.id, ModuleHop::AdapterBundle.as_str()));
            format!(
                r#"const runtime = await import({runtime});
const component = await import({bundle});

const COMMANDS = ["PAUSE", "RESUME", "QUIT"];

export async function init(container, context, host) {{
  const game = await component.default({{ container, context, runtime, emit: (event) => host.emit(event) }});
  return {{
    onHostCommand(command) {{
      if (command && COMMANDS.includes(command.type) && game.onHostCommand) game.onHostCommand(command);
    }},
    destroy() {{
      if (game.destroy) game.destroy();
      container.replaceChildren();
    }},
  }};
}}

export default init;
"#
            )
        }
        ModuleHop::AdapterBundle => {
            let component = js_string(&manifest.entry_url);
            format!("export * from {component};\nexport {{ default }} from {component};\n")
        }
    };
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::loader::{dynamic_imports, reexport_target, ResolutionPipeline, StaticModuleFetcher, DEFAULT_STAGE_TIMEOUT};
    use crate::hub::manifest::tests::manifest;

    const PUBLIC: &str = "https://hub.example.com";

    fn module_manifest() -> GameManifest {
        let mut m = manifest("math-blitz");
        m.runtime = RuntimeKind::EsmModule;
        m.entry_url = "https://assets.example.com/math-blitz/game.js".into();
        m
    }

    fn config() -> LoaderConfig {
        LoaderConfig { public_url: PUBLIC.into(), ..Default::default() }
    }

    #[test]
    fn test_hop_names() {
        for hop in [ModuleHop::Entry, ModuleHop::Adapter, ModuleHop::AdapterBundle] {
            assert_eq!(hop.as_str().parse::<ModuleHop>().unwrap(), hop);
        }
        assert!("component".parse::<ModuleHop>().is_err());
    }

    #[test]
    fn test_iframe_game_has_no_modules() {
        let err = render_module(&manifest("quiz"), ModuleHop::Entry, &config()).unwrap_err();
        assert_eq!(err, ModuleError::NotModule("quiz".into()));
    }

    #[test]
    fn test_specifiers_are_absolute() {
        let m = module_manifest();
        let entry = render_module(&m, ModuleHop::Entry, &config()).unwrap();
        assert_eq!(
            reexport_target(&entry).as_deref(),
            Some("https://hub.example.com/games/math-blitz/module/adapter")
        );

        let adapter = render_module(&m, ModuleHop::Adapter, &config()).unwrap();
        assert_eq!(
            dynamic_imports(&adapter),
            vec![
                DEFAULT_UI_RUNTIME_URL.to_string(),
                "https://hub.example.com/games/math-blitz/module/adapter-bundle".to_string(),
            ]
        );

        let bundle = render_module(&m, ModuleHop::AdapterBundle, &config()).unwrap();
        assert_eq!(reexport_target(&bundle).as_deref(), Some("https://assets.example.com/math-blitz/game.js"));
    }

    #[tokio::test]
    async fn test_rendered_chain_resolves() {
        let m = module_manifest();
        let config = LoaderConfig { ui_runtime_url: Some(DEFAULT_UI_RUNTIME_URL.into()), ..config() };
        let mut fetcher = StaticModuleFetcher::new().with_module(DEFAULT_UI_RUNTIME_URL, "export const h = 1;");
        for hop in [ModuleHop::Entry, ModuleHop::Adapter, ModuleHop::AdapterBundle] {
            fetcher = fetcher.with_module(
                config.module_url(&m.id, hop.as_str()),
                render_module(&m, hop, &config).unwrap(),
            );
        }

        let resolved = ResolutionPipeline {
            entry_url: config.module_url(&m.id, "entry"),
            pinned_runtime: config.ui_runtime_url.clone(),
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
        .resolve(&fetcher)
        .await
        .unwrap();
        assert!(resolved.component.url.ends_with("/adapter-bundle"));
    }
}
