//! Manifest Registry
//!
//! Catalog of pluggable mini-games. Discovery applies, in order:
//! 1. `disabled` exclusion
//! 2. Rollout gating (stable per player/game cohort)
//! 3. Caller filters (capability, free-text search)
//! 4. Hub version gate (reported, never silently dropped)

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::hash::in_rollout;
use crate::core::version::Version;
use crate::HUB_PROTOCOL_VERSION;

/// How a game executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// Isolated browsing context. No game code runs in the host.
    IframeHtml,
    /// Dynamically composed module chain.
    EsmModule,
}

fn full_rollout() -> u8 {
    100
}

/// Declarative description of a pluggable mini-game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameManifest {
    /// Stable game identifier.
    pub id: String,
    /// URL-friendly name.
    pub slug: String,
    /// Display title.
    pub title: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
    /// Game version.
    pub version: Version,
    /// Runtime kind.
    pub runtime: RuntimeKind,
    /// Document URL (`iframe-html`) or component bundle URL (`esm-module`).
    pub entry_url: String,
    /// Icon image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    /// Thumbnail image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// Declared capabilities (e.g. `progress`, `leaderboard`).
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Oldest hub protocol version able to host this game.
    pub min_hub_version: Version,
    /// Share of players (0-100) that see the game.
    #[serde(default = "full_rollout")]
    pub rollout_percentage: u8,
    /// Hidden from discovery when set.
    #[serde(default)]
    pub disabled: bool,
    /// Free-form metadata passed through untouched.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl GameManifest {
    /// Whether this manifest declares a capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether `player_id` is inside this game's rollout cohort.
    ///
    /// Anonymous callers only see fully rolled-out games.
    pub fn visible_to(&self, player_id: Option<&str>) -> bool {
        match player_id {
            _ if self.rollout_percentage >= 100 => true,
            Some(player) => in_rollout(player, &self.id, self.rollout_percentage),
            None => false,
        }
    }

    fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.title.to_lowercase().contains(&needle) || self.slug.to_lowercase().contains(&needle)
    }
}

/// Caller-supplied discovery filter.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    /// Player requesting the list (drives rollout gating).
    pub player_id: Option<String>,
    /// Hub protocol version declared by the caller.
    pub hub_version: Option<Version>,
    /// Only games declaring this capability.
    pub capability: Option<String>,
    /// Case-insensitive match against title or slug.
    pub search: Option<String>,
}

/// A manifest excluded by the version gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncompatibleGame {
    /// Game identifier.
    pub game_id: String,
    /// Hub version the game requires.
    pub required: Version,
    /// Hub version the caller declared.
    pub declared: Version,
}

/// Discovery result.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Games the caller may launch.
    pub games: Vec<GameManifest>,
    /// Games hidden only because the caller's hub is too old.
    pub incompatible: Vec<IncompatibleGame>,
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No manifest with this id.
    #[error("game not found: {0}")]
    NotFound(String),

    /// Manifest exists but is disabled.
    #[error("game disabled: {0}")]
    Disabled(String),

    /// Player outside the rollout cohort.
    #[error("game not available for player: {0}")]
    NotInRollout(String),

    /// Caller's hub is older than the manifest requires.
    #[error("game {game_id} requires hub {required}, caller declared {declared}")]
    IncompatibleHostVersion {
        /// Game identifier.
        game_id: String,
        /// Required version.
        required: Version,
        /// Declared version.
        declared: Version,
    },

    /// Two manifests share an id.
    #[error("duplicate manifest id: {0}")]
    DuplicateId(String),

    /// Rollout percentage outside 0..=100.
    #[error("manifest {id} has rollout percentage {percentage} outside 0..=100")]
    InvalidRollout {
        /// Game identifier.
        id: String,
        /// Offending value.
        percentage: u8,
    },

    /// Manifest file unreadable.
    #[error("failed to read manifests: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest file malformed.
    #[error("malformed manifests: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read-only catalog of game manifests.
#[derive(Debug, Clone, Default)]
pub struct ManifestRegistry {
    manifests: BTreeMap<String, GameManifest>,
}

impl ManifestRegistry {
    /// Build a registry, rejecting duplicate ids and bad rollout values.
    pub fn new(manifests: Vec<GameManifest>) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for manifest in manifests {
            if manifest.rollout_percentage > 100 {
                return Err(RegistryError::InvalidRollout {
                    id: manifest.id,
                    percentage: manifest.rollout_percentage,
                });
            }
            if map.contains_key(&manifest.id) {
                return Err(RegistryError::DuplicateId(manifest.id));
            }
            map.insert(manifest.id.clone(), manifest);
        }
        Ok(Self { manifests: map })
    }

    /// Parse a JSON array of manifests.
    pub fn from_json_str(json: &str) -> Result<Self, RegistryError> {
        let manifests: Vec<GameManifest> = serde_json::from_str(json)?;
        Self::new(manifests)
    }

    /// Load a JSON array of manifests from disk.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let json = std::fs::read_to_string(path)?;
        let registry = Self::from_json_str(&json)?;
        info!(path = %path.display(), games = registry.len(), "loaded game manifests");
        Ok(registry)
    }

    /// Number of manifests, disabled included.
    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Look up a manifest regardless of discovery gates.
    pub fn get(&self, game_id: &str) -> Option<&GameManifest> {
        self.manifests.get(game_id)
    }

    /// Games visible to the caller.
    pub fn list_games(&self, filter: &DiscoveryFilter) -> Discovery {
        let declared = filter.hub_version.clone().unwrap_or(HUB_PROTOCOL_VERSION);
        let player = filter.player_id.as_deref();
        let mut discovery = Discovery::default();

        for manifest in self.manifests.values() {
            if manifest.disabled || !manifest.visible_to(player) {
                continue;
            }
            if let Some(ref capability) = filter.capability {
                if !manifest.has_capability(capability) {
                    continue;
                }
            }
            if let Some(ref search) = filter.search {
                if !manifest.matches_search(search) {
                    continue;
                }
            }
            if manifest.min_hub_version > declared {
                debug!(game_id = %manifest.id, required = %manifest.min_hub_version, %declared, "version gated");
                discovery.incompatible.push(IncompatibleGame {
                    game_id: manifest.id.clone(),
                    required: manifest.min_hub_version.clone(),
                    declared: declared.clone(),
                });
                continue;
            }
            discovery.games.push(manifest.clone());
        }

        discovery
    }

    /// Apply every discovery gate to a single game before launch.
    pub fn resolve_launchable(
        &self,
        game_id: &str,
        player_id: &str,
        hub_version: Option<&Version>,
    ) -> Result<&GameManifest, RegistryError> {
        let manifest = self
            .get(game_id)
            .ok_or_else(|| RegistryError::NotFound(game_id.to_string()))?;

        if manifest.disabled {
            return Err(RegistryError::Disabled(game_id.to_string()));
        }
        if !manifest.visible_to(Some(player_id)) {
            return Err(RegistryError::NotInRollout(game_id.to_string()));
        }

        let declared = hub_version.cloned().unwrap_or(HUB_PROTOCOL_VERSION);
        if manifest.min_hub_version > declared {
            return Err(RegistryError::IncompatibleHostVersion {
                game_id: game_id.to_string(),
                required: manifest.min_hub_version.clone(),
                declared,
            });
        }

        Ok(manifest)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn manifest(id: &str) -> GameManifest {
        GameManifest {
            id: id.to_string(),
            slug: id.to_string(),
            title: id.replace('-', " "),
            description: String::new(),
            version: Version::new(1, 0, 0),
            runtime: RuntimeKind::IframeHtml,
            entry_url: format!("https://games.example.com/{id}/index.html"),
            icon_url: None,
            thumbnail_url: None,
            capabilities: BTreeSet::new(),
            min_hub_version: Version::new(1, 0, 0),
            rollout_percentage: 100,
            disabled: false,
            metadata: BTreeMap::new(),
        }
    }

    fn ids(discovery: &Discovery) -> Vec<&str> {
        discovery.games.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_disabled_never_listed() {
        let mut hidden = manifest("hidden");
        hidden.disabled = true;
        let registry = ManifestRegistry::new(vec![manifest("math-blitz"), hidden]).unwrap();

        for player in ["a", "b", "c"] {
            let filter = DiscoveryFilter {
                player_id: Some(player.into()),
                ..Default::default()
            };
            assert_eq!(ids(&registry.list_games(&filter)), vec!["math-blitz"]);
        }
        assert!(registry.get("hidden").is_some());
    }

    #[test]
    fn test_rollout_stable_per_player() {
        let mut partial = manifest("word-quest");
        partial.rollout_percentage = 50;
        let registry = ManifestRegistry::new(vec![partial]).unwrap();

        for i in 0..50 {
            let filter = DiscoveryFilter {
                player_id: Some(format!("player-{i}")),
                ..Default::default()
            };
            let first = registry.list_games(&filter).games.len();
            let second = registry.list_games(&filter).games.len();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_anonymous_sees_only_full_rollout() {
        let mut partial = manifest("beta-game");
        partial.rollout_percentage = 99;
        let registry = ManifestRegistry::new(vec![manifest("math-blitz"), partial]).unwrap();

        let discovery = registry.list_games(&DiscoveryFilter::default());
        assert_eq!(ids(&discovery), vec!["math-blitz"]);
    }

    #[test]
    fn test_version_gate_reports_incompatible() {
        let mut future = manifest("future-game");
        future.min_hub_version = Version::new(9, 0, 0);
        let registry = ManifestRegistry::new(vec![manifest("math-blitz"), future]).unwrap();

        let discovery = registry.list_games(&DiscoveryFilter {
            hub_version: Some(Version::new(1, 0, 0)),
            ..Default::default()
        });
        assert_eq!(ids(&discovery), vec!["math-blitz"]);
        assert_eq!(discovery.incompatible.len(), 1);
        assert_eq!(discovery.incompatible[0].game_id, "future-game");
        assert_eq!(discovery.incompatible[0].required, Version::new(9, 0, 0));
    }

    #[test]
    fn test_capability_and_search_filters() {
        let mut saving = manifest("math-blitz");
        saving.capabilities.insert("progress".into());
        let registry = ManifestRegistry::new(vec![saving, manifest("word-quest")]).unwrap();

        let by_cap = registry.list_games(&DiscoveryFilter {
            capability: Some("progress".into()),
            ..Default::default()
        });
        assert_eq!(ids(&by_cap), vec!["math-blitz"]);

        let by_search = registry.list_games(&DiscoveryFilter {
            search: Some("WORD".into()),
            ..Default::default()
        });
        assert_eq!(ids(&by_search), vec!["word-quest"]);
    }

    #[test]
    fn test_resolve_launchable_gates() {
        let mut disabled = manifest("off");
        disabled.disabled = true;
        let mut closed = manifest("closed");
        closed.rollout_percentage = 0;
        let mut future = manifest("future");
        future.min_hub_version = Version::new(99, 0, 0);
        let registry =
            ManifestRegistry::new(vec![manifest("ok"), disabled, closed, future]).unwrap();

        assert!(registry.resolve_launchable("ok", "p", None).is_ok());
        assert!(matches!(registry.resolve_launchable("nope", "p", None), Err(RegistryError::NotFound(_))));
        assert!(matches!(registry.resolve_launchable("off", "p", None), Err(RegistryError::Disabled(_))));
        assert!(matches!(registry.resolve_launchable("closed", "p", None), Err(RegistryError::NotInRollout(_))));
        assert!(matches!(
            registry.resolve_launchable("future", "p", None),
            Err(RegistryError::IncompatibleHostVersion { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicates_and_bad_rollout() {
        let dup = ManifestRegistry::new(vec![manifest("a"), manifest("a")]);
        assert!(matches!(dup, Err(RegistryError::DuplicateId(_))));

        let mut bad = manifest("b");
        bad.rollout_percentage = 150;
        assert!(matches!(ManifestRegistry::new(vec![bad]), Err(RegistryError::InvalidRollout { .. })));
    }

    #[test]
    fn test_parse_wire_format() {
        let json = r#"[{
            "id": "math-blitz",
            "slug": "math-blitz",
            "title": "Math Blitz",
            "version": "1.2.0",
            "runtime": "esm-module",
            "entryUrl": "https://cdn.example.com/math-blitz/bundle.js",
            "capabilities": ["progress", "leaderboard"],
            "minHubVersion": "1.0.0",
            "rolloutPercentage": 40
        }]"#;
        let registry = ManifestRegistry::from_json_str(json).unwrap();
        let m = registry.get("math-blitz").unwrap();
        assert_eq!(m.runtime, RuntimeKind::EsmModule);
        assert_eq!(m.rollout_percentage, 40);
        assert!(!m.disabled);
        assert!(m.has_capability("leaderboard"));
    }
}
