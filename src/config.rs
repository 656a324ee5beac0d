//! Watch configuration for pkgwatch.
//!
//! This module defines the `watch` section shapes found in `package.json` and in an
//! optional override file, and merges both sources into a single `ResolvedConfig`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

/// Mapping from script name to its watch specification.
pub type WatchConfig = BTreeMap<String, WatchSpec>;

/// Watch entries as read from disk, before each one is validated.
pub type RawWatchConfig = BTreeMap<String, Value>;

/// The subset of `package.json` that pkgwatch reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    /// Declared npm scripts (name -> command line).
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    /// Watch entries declared in the manifest.
    #[serde(default)]
    pub watch: RawWatchConfig,
}

/// A standalone config file that only contributes `watch` entries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverrideFile {
    #[serde(default)]
    pub watch: RawWatchConfig,
}

/// One or many glob patterns.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PatternList {
    One(String),
    Many(Vec<String>),
}

impl PatternList {
    /// Flattens into an ordered list of patterns.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            PatternList::One(pattern) => vec![pattern.clone()],
            PatternList::Many(patterns) => patterns.clone(),
        }
    }
}

impl Default for PatternList {
    fn default() -> Self {
        PatternList::Many(Vec::new())
    }
}

/// A watch entry as written in configuration.
///
/// Either a bare pattern, a list of patterns, or a full options object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSpec {
    Pattern(String),
    Patterns(Vec<String>),
    Options(WatchOptions),
}

impl WatchSpec {
    /// Parses one raw entry, telling the three shapes apart by JSON type.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(pattern) => Ok(WatchSpec::Pattern(pattern)),
            Value::Array(items) => serde_json::from_value(Value::Array(items))
                .map(WatchSpec::Patterns)
                .context("patterns must be strings"),
            Value::Object(fields) => serde_json::from_value(Value::Object(fields))
                .map(WatchSpec::Options)
                .context("invalid watch options"),
            other => bail!("expected a pattern, a list of patterns or an object, got {}", other),
        }
    }

    /// Resolves any shape into a full `WatchOptions` value.
    pub fn normalize(&self) -> WatchOptions {
        match self {
            WatchSpec::Pattern(pattern) => {
                WatchOptions::with_patterns(PatternList::One(pattern.clone()))
            }
            WatchSpec::Patterns(patterns) => {
                WatchOptions::with_patterns(PatternList::Many(patterns.clone()))
            }
            WatchSpec::Options(options) => options.clone(),
        }
    }
}

/// Full set of per-script watch options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchOptions {
    /// Globs that trigger a restart.
    pub patterns: PatternList,
    /// File extensions to watch (passed to `--ext`).
    #[serde(default)]
    pub extensions: Option<PatternList>,
    /// Globs to ignore.
    #[serde(default)]
    pub ignore: Option<PatternList>,
    /// Forward output without prefixes or filtering.
    #[serde(default, deserialize_with = "lenient_bool")]
    pub quiet: bool,
    /// Hand the terminal directly to the child.
    #[serde(default, deserialize_with = "exactly_true")]
    pub inherit: bool,
    /// Use polling instead of native file events.
    #[serde(default, deserialize_with = "truthy")]
    pub legacy_watch: bool,
    /// Restart delay in milliseconds.
    #[serde(default)]
    pub delay: Option<u64>,
    /// Clear the screen whenever the script restarts.
    #[serde(default, deserialize_with = "exactly_true")]
    pub clear_buffer: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub verbose: bool,
    /// Only run the script after the first change.
    #[serde(default, deserialize_with = "truthy")]
    pub run_on_change_only: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub silent: bool,
}

impl WatchOptions {
    /// Creates options with the given patterns and every flag off.
    pub fn with_patterns(patterns: PatternList) -> Self {
        Self {
            patterns,
            ..Self::default()
        }
    }

    /// Returns advisory messages for conflicting options.
    ///
    /// Conflicts are not corrected; both flags are still forwarded.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.verbose && self.silent {
            warnings.push("Silent and Verbose can not both be on".to_string());
        }
        warnings
    }
}

// Flag values are read loosely: a flag of the wrong type switches the option off
// instead of rejecting the whole entry.

// `quiet` has historically been accepted as either `true` or `"true"`.
fn lenient_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(value) => value,
        Value::String(text) => text == "true",
        _ => false,
    })
}

// Any non-empty, non-zero value turns the flag on.
fn truthy<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => false,
        Value::Bool(value) => value,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

fn exactly_true<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(matches!(Value::deserialize(deserializer)?, Value::Bool(true)))
}

/// The merged configuration handed to the supervisor.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    /// Merged watch entries.
    pub watch: WatchConfig,
    /// Names of scripts declared in the manifest.
    pub scripts: BTreeSet<String>,
}

/// Merges manifest and override watch entries.
///
/// Override entries form the base; manifest entries replace same-named ones.
/// Invalid entries are logged and skipped.
pub fn resolve(manifest: Manifest, overrides: Option<OverrideFile>) -> ResolvedConfig {
    let mut raw = overrides.map(|file| file.watch).unwrap_or_default();
    raw.extend(manifest.watch);
    ResolvedConfig {
        watch: parse_watch(raw),
        scripts: manifest.scripts.into_keys().collect(),
    }
}

/// Validates every raw entry on its own, dropping the ones that do not parse.
pub fn parse_watch(raw: RawWatchConfig) -> WatchConfig {
    raw.into_iter()
        .filter_map(|(script, value)| match WatchSpec::from_value(value) {
            Ok(spec) => Some((script, spec)),
            Err(err) => {
                warn!(script = %script, "skipping watch entry for \"{}\": {:#}", script, err);
                None
            }
        })
        .collect()
}

/// Loads `package.json` from a project directory.
pub fn load_manifest(project_dir: &Path) -> Result<Manifest> {
    let path = project_dir.join("package.json");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;
    Ok(manifest)
}

/// Loads an override file, as TOML when the extension says so and JSON otherwise.
pub fn load_override(path: &Path) -> Result<OverrideFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let file: OverrideFile = if is_toml {
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?
    } else {
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?
    };
    Ok(file)
}

/// Loads and merges every configuration source for a project.
pub fn load(project_dir: &Path, config_path: Option<&Path>) -> Result<ResolvedConfig> {
    let manifest = load_manifest(project_dir)?;
    let overrides = config_path.map(load_override).transpose()?;
    Ok(resolve(manifest, overrides))
}
