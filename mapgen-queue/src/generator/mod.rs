//! Contract with the map-generation library.
//!
//! The queue never generates terrain itself. It drives an implementation of
//! [`MapGenerator`] on the blocking thread pool and collects the files the
//! resulting [`GeneratedMap`] reports.

pub mod task;
pub mod validation;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::GenerationError;
use crate::queue::SettingsBundle;
use crate::session::{Coordinates, GameCode};

pub use task::{GenerationContext, GenerationOutput, run_generation};

/// Description of an elevation data provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub code: String,
    /// Whether the provider cannot run without settings.
    pub settings_required: bool,
}

impl ProviderInfo {
    pub fn new(code: impl Into<String>, settings_required: bool) -> Self {
        Self {
            code: code.into(),
            settings_required,
        }
    }
}

/// Custom schemas loaded from the templates directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomSchemas {
    pub texture: Option<Vec<Value>>,
    pub tree: Option<Vec<Value>>,
    pub buildings: Option<Vec<Value>>,
}

/// Everything the generator needs to build one map.
#[derive(Debug, Clone)]
pub struct MapRequest {
    pub game: GameCode,
    pub provider: ProviderInfo,
    /// Sanitized provider settings, present when the caller sent any.
    pub provider_settings: Option<Value>,
    pub coordinates: Coordinates,
    pub size: u32,
    pub rotation: i32,
    pub output_size: Option<u32>,
    pub is_public: bool,
    /// Working directory the map writes into.
    pub map_directory: PathBuf,
    /// Components to enable. Empty enables the generator defaults.
    pub components: Vec<String>,
    pub settings: SettingsBundle,
    pub custom_osm: Option<PathBuf>,
    pub custom_dem: Option<PathBuf>,
    pub custom_template: Option<PathBuf>,
    pub schemas: CustomSchemas,
}

/// Entry point of the generation library.
///
/// Implementations are shared across workers and called from blocking
/// threads.
pub trait MapGenerator: Send + Sync {
    /// Look up a provider by code.
    fn provider(&self, code: &str) -> Option<ProviderInfo>;

    /// Check provider settings against the provider's own schema.
    fn validate_provider_settings(&self, provider: &ProviderInfo, settings: &Value)
    -> Result<(), String>;

    /// Build a map ready for generation.
    fn create_map(&self, request: MapRequest) -> Result<Box<dyn GeneratedMap>, GenerationError>;
}

/// A map under construction.
pub trait GeneratedMap: Send {
    /// Effective map size.
    fn size(&self) -> u32;

    fn output_size(&self) -> Option<u32>;

    /// Run generation. The iterator yields one progress message per step
    /// and is finite.
    fn generate(&mut self) -> Box<dyn Iterator<Item = Result<String, GenerationError>> + '_>;

    /// Assets produced by a component, keyed by asset name.
    ///
    /// `None` if the component was not part of the run.
    fn component_assets(&self, component: &str) -> Option<BTreeMap<String, PathBuf>>;

    /// Pack the whole map into a zip archive written exactly at
    /// `archive_path` and return that path.
    fn pack(&self, archive_path: &Path) -> Result<PathBuf, GenerationError>;

    /// Preview images produced by the run.
    fn previews(&self) -> Vec<PathBuf>;
}
