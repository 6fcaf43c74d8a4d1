//! Configuration: the synchronize set, direction, strategy, rate limits, and
//! size limits loaded from `~/.shadow-sync/config.toml`.
//!
//! Mirrors `at_core::config::Config`: a top-level struct of `#[serde(default)]`
//! sections, each with its own `Default` impl and default-fn helpers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::CoreError;
use crate::model::ShadowKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub synchronize: SynchronizeConfig,
    #[serde(default)]
    pub direction: DirectionConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub size: SizeConfig,
    #[serde(default)]
    pub dao: DaoConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            synchronize: SynchronizeConfig::default(),
            direction: DirectionConfig::default(),
            strategy: StrategyConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            size: SizeConfig::default(),
            dao: DaoConfig::default(),
            cloud: CloudConfig::default(),
            mqtt: MqttConfig::default(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_format() -> String {
    "text".into()
}

impl Config {
    /// Load from `~/.shadow-sync/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, CoreError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| CoreError::ConfigIo(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| CoreError::ConfigParse(e.to_string()))?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, CoreError> {
        toml::to_string_pretty(self).map_err(|e| CoreError::ConfigParse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shadow-sync")
            .join("config.toml")
    }

    /// The ordered set of (thing, shadow) pairs currently configured for
    /// sync: the core thing's classic/named shadows, followed by the
    /// `shadow_documents` list, each thing's named shadows de-duplicated.
    pub fn synchronize_set(&self) -> Vec<ShadowKey> {
        self.synchronize.resolved_keys()
    }
}

// ---------------------------------------------------------------------------
// synchronize.*
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynchronizeConfig {
    #[serde(default)]
    pub core_thing: Option<CoreThingConfig>,
    #[serde(default, deserialize_with = "deserialize_shadow_documents")]
    pub shadow_documents: Vec<ShadowDocumentSpec>,
}

/// `shadowDocuments` accepts either a list of `{thingName, classic?, namedShadows?}`
/// entries or a map of `thingName -> {classic?, namedShadows?}`; both forms
/// normalize to the same `Vec<ShadowDocumentSpec>` before `resolved_keys`
/// merges them with `core_thing`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShadowDocumentsInput {
    List(Vec<ShadowDocumentSpec>),
    Map(std::collections::HashMap<String, ShadowDocumentBody>),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ShadowDocumentBody {
    #[serde(default)]
    classic: bool,
    #[serde(default)]
    named_shadows: Vec<String>,
}

fn deserialize_shadow_documents<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<ShadowDocumentSpec>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match ShadowDocumentsInput::deserialize(deserializer)? {
        ShadowDocumentsInput::List(list) => Ok(list),
        ShadowDocumentsInput::Map(map) => Ok(map
            .into_iter()
            .map(|(thing_name, body)| ShadowDocumentSpec {
                thing_name,
                classic: body.classic,
                named_shadows: body.named_shadows,
            })
            .collect()),
    }
}

impl Default for SynchronizeConfig {
    fn default() -> Self {
        Self {
            core_thing: None,
            shadow_documents: Vec::new(),
        }
    }
}

impl SynchronizeConfig {
    /// Flatten `core_thing` plus `shadow_documents` into an ordered,
    /// deduplicated key list. Entries for the same `thing_name` (whether
    /// they arrived via `core_thing` or a repeated `shadow_documents` entry)
    /// have their `named_shadows` unioned, matching the spec's "list OR map,
    /// both merged" wording.
    pub fn resolved_keys(&self) -> Vec<ShadowKey> {
        let mut order: Vec<String> = Vec::new();
        let mut classic: std::collections::HashMap<String, bool> = std::collections::HashMap::new();
        let mut named: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();

        let mut push_thing = |thing: &str| {
            if !classic.contains_key(thing) {
                order.push(thing.to_string());
                classic.insert(thing.to_string(), false);
                named.insert(thing.to_string(), Vec::new());
            }
        };

        if let Some(core) = &self.core_thing {
            push_thing(&core.thing_name);
            if core.classic {
                *classic.get_mut(&core.thing_name).unwrap() = true;
            }
            let entry = named.get_mut(&core.thing_name).unwrap();
            for shadow in &core.named_shadows {
                if !entry.contains(shadow) {
                    entry.push(shadow.clone());
                }
            }
        }

        for doc in &self.shadow_documents {
            push_thing(&doc.thing_name);
            if doc.classic {
                *classic.get_mut(&doc.thing_name).unwrap() = true;
            }
            let entry = named.get_mut(&doc.thing_name).unwrap();
            for shadow in &doc.named_shadows {
                if !entry.contains(shadow) {
                    entry.push(shadow.clone());
                }
            }
        }

        let mut keys = Vec::new();
        for thing in order {
            if classic[&thing] {
                keys.push(ShadowKey::classic(thing.clone()));
            }
            for shadow in &named[&thing] {
                keys.push(ShadowKey::new(thing.clone(), shadow.clone()));
            }
        }
        keys
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreThingConfig {
    pub thing_name: String,
    #[serde(default)]
    pub classic: bool,
    #[serde(default)]
    pub named_shadows: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowDocumentSpec {
    pub thing_name: String,
    #[serde(default)]
    pub classic: bool,
    #[serde(default)]
    pub named_shadows: Vec<String>,
}

// ---------------------------------------------------------------------------
// direction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DirectionConfig {
    BetweenDeviceAndCloud,
    DeviceToCloud,
    CloudToDevice,
}

impl Default for DirectionConfig {
    fn default() -> Self {
        DirectionConfig::BetweenDeviceAndCloud
    }
}

// ---------------------------------------------------------------------------
// strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(rename = "type", default = "default_strategy_type")]
    pub kind: StrategyKind,
    #[serde(default = "default_strategy_delay")]
    pub delay: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: default_strategy_type(),
            delay: default_strategy_delay(),
        }
    }
}

fn default_strategy_type() -> StrategyKind {
    StrategyKind::RealTime
}
fn default_strategy_delay() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
    RealTime,
    Periodic,
}

// ---------------------------------------------------------------------------
// rateLimits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_outbound_rate")]
    pub max_outbound_sync_updates_per_second: u32,
    #[serde(default = "default_total_local_rate")]
    pub max_total_local_requests_rate: u32,
    #[serde(default = "default_per_thing_rate")]
    pub max_local_requests_per_second_per_thing: u32,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            max_outbound_sync_updates_per_second: default_outbound_rate(),
            max_total_local_requests_rate: default_total_local_rate(),
            max_local_requests_per_second_per_thing: default_per_thing_rate(),
        }
    }
}

fn default_outbound_rate() -> u32 {
    100
}
fn default_total_local_rate() -> u32 {
    200
}
fn default_per_thing_rate() -> u32 {
    20
}

// ---------------------------------------------------------------------------
// size
// ---------------------------------------------------------------------------

/// Hard ceiling on `shadow_document_size_limit_bytes`, independent of what a
/// config file requests.
pub const SHADOW_DOCUMENT_SIZE_HARD_CEILING: usize = 30_720;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeConfig {
    #[serde(default = "default_size_limit")]
    pub shadow_document_size_limit_bytes: usize,
}

impl Default for SizeConfig {
    fn default() -> Self {
        Self {
            shadow_document_size_limit_bytes: default_size_limit(),
        }
    }
}

fn default_size_limit() -> usize {
    8192
}

impl SizeConfig {
    /// The effective limit: the configured value clamped to the hard
    /// ceiling.
    pub fn effective_limit(&self) -> usize {
        self.shadow_document_size_limit_bytes
            .min(SHADOW_DOCUMENT_SIZE_HARD_CEILING)
    }
}

// ---------------------------------------------------------------------------
// dao / cloud / mqtt — ambient wiring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaoConfig {
    #[serde(default = "default_dao_path")]
    pub path: String,
}

impl Default for DaoConfig {
    fn default() -> Self {
        Self {
            path: default_dao_path(),
        }
    }
}

fn default_dao_path() -> String {
    "~/.shadow-sync/shadow.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_cloud_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_cloud_timeout")]
    pub timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint: default_cloud_endpoint(),
            timeout_secs: default_cloud_timeout(),
        }
    }
}

fn default_cloud_endpoint() -> String {
    "https://shadow.example.com".into()
}
fn default_cloud_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub broker_host: String,
    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: default_mqtt_host(),
            broker_port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".into()
}
fn default_mqtt_port() -> u16 {
    8883
}
fn default_mqtt_client_id() -> String {
    "shadow-sync".into()
}
