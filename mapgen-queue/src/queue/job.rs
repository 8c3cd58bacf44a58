//! Job model: what a queued generation request carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::session::{Coordinates, GameCode, SessionId, derive};

/// A JSON object holding one block of generator settings.
pub type SettingsBlock = Map<String, Value>;

/// Typed bundle of the per-component settings blocks.
///
/// Each block is passed to the generator unchanged; `None` leaves the
/// generator defaults in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsBundle {
    pub dem: Option<SettingsBlock>,
    pub background: Option<SettingsBlock>,
    pub grle: Option<SettingsBlock>,
    pub i3d: Option<SettingsBlock>,
    pub texture: Option<SettingsBlock>,
    pub satellite: Option<SettingsBlock>,
}

impl SettingsBundle {
    fn set(block: &mut Option<SettingsBlock>, key: &str, value: impl Into<Value>) {
        block
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
    }
}

/// User-supplied overlays referencing files or inline data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomOverlays {
    /// Inline OSM XML, saved to disk before generation.
    pub osm_xml: Option<String>,
    /// File name of a pre-uploaded OSM file.
    pub osm_path: Option<String>,
    /// File name of a pre-uploaded DEM.
    pub dem_path: Option<String>,
    pub texture_schema_path: Option<String>,
    pub tree_schema_path: Option<String>,
    pub buildings_schema_path: Option<String>,
    pub map_template_path: Option<String>,
}

/// Inbound generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub game: GameCode,
    pub dtm_code: String,
    pub coordinates: Coordinates,
    pub size: u32,
    #[serde(default)]
    pub output_size: Option<u32>,
    #[serde(default)]
    pub rotation: i32,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub dtm_settings: Option<Value>,
    #[serde(default)]
    pub settings: SettingsBundle,
    #[serde(default)]
    pub overlays: CustomOverlays,
}

impl GenerationPayload {
    /// Create a payload with default settings and no overlays.
    pub fn new(game: GameCode, dtm_code: impl Into<String>, coordinates: Coordinates, size: u32) -> Self {
        Self {
            game,
            dtm_code: dtm_code.into(),
            coordinates,
            size,
            output_size: None,
            rotation: 0,
            is_public: false,
            dtm_settings: None,
            settings: SettingsBundle::default(),
            overlays: CustomOverlays::default(),
        }
    }

    pub fn with_output_size(mut self, output_size: u32) -> Self {
        self.output_size = Some(output_size);
        self
    }

    pub fn with_rotation(mut self, rotation: i32) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    pub fn with_dtm_settings(mut self, settings: Value) -> Self {
        self.dtm_settings = Some(settings);
        self
    }

    pub fn with_settings(mut self, settings: SettingsBundle) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_overlays(mut self, overlays: CustomOverlays) -> Self {
        self.overlays = overlays;
        self
    }

    /// Identity this payload is tracked under.
    pub fn session_id(&self) -> SessionId {
        derive(self.coordinates, self.game)
    }
}

/// Which parts of the generator to run and which outputs to return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Generator components to enable. Empty runs the generator default set.
    pub components: Vec<String>,
    /// Assets to extract per component. Empty returns every asset.
    pub assets: Vec<String>,
    /// Package the whole map instead of extracting assets.
    pub include_all: bool,
}

impl JobSpec {
    pub fn new<C, A>(components: C, assets: A) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
            assets: assets.into_iter().map(Into::into).collect(),
            include_all: false,
        }
    }

    /// A spec that packages every generated file.
    pub fn full_map() -> Self {
        Self {
            components: Vec::new(),
            assets: Vec::new(),
            include_all: true,
        }
    }
}

/// Preset generation requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationKind {
    Dem,
    BackgroundMesh,
    WaterMesh,
    Plants,
    Farmlands,
    /// Texture layers; no names returns every layer.
    TextureImages { layers: Vec<String> },
    SatelliteOverview,
    SatelliteBackground,
    Fields,
    Forests,
    Splines,
    FullMap,
}

impl GenerationKind {
    /// Components and assets this kind runs.
    pub fn job_spec(&self) -> JobSpec {
        match self {
            Self::Dem => JobSpec::new(["Background"], ["dem"]),
            Self::BackgroundMesh => JobSpec::new(["Background"], ["background_mesh"]),
            Self::WaterMesh => JobSpec::new(["Background"], ["water_mesh"]),
            Self::Plants => JobSpec::new(["Texture", "GRLE"], ["plants"]),
            Self::Farmlands => JobSpec::new(["Texture", "GRLE"], ["farmlands"]),
            Self::TextureImages { layers } => JobSpec::new(["Texture"], layers.iter().cloned()),
            Self::SatelliteOverview => JobSpec::new(["Satellite"], ["overview"]),
            Self::SatelliteBackground => JobSpec::new(["Satellite"], ["background"]),
            Self::Fields => JobSpec::new(["Background", "Texture", "I3d"], ["fields"]),
            Self::Forests => JobSpec::new(["Background", "Texture", "I3d"], ["forests"]),
            Self::Splines => JobSpec::new(["Background", "Texture", "I3d"], ["splines"]),
            Self::FullMap => JobSpec::full_map(),
        }
    }

    /// Apply the settings overrides this kind needs.
    pub fn apply(&self, payload: &mut GenerationPayload) {
        let settings = &mut payload.settings;
        match self {
            Self::Dem => SettingsBundle::set(&mut settings.dem, "water_depth", 20),
            Self::BackgroundMesh | Self::WaterMesh => {
                let water = matches!(self, Self::WaterMesh);
                SettingsBundle::set(&mut settings.background, "generate_background", !water);
                SettingsBundle::set(&mut settings.background, "generate_water", water);
            }
            Self::Forests => SettingsBundle::set(&mut settings.i3d, "add_trees", true),
            Self::SatelliteOverview | Self::SatelliteBackground => {
                SettingsBundle::set(&mut settings.satellite, "download_images", true)
            }
            _ => {}
        }
    }
}

/// A unit of work owned by the queue until dequeued.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub session: SessionId,
    pub payload: GenerationPayload,
    pub spec: JobSpec,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job for a payload.
    pub fn new(payload: GenerationPayload, spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session: payload.session_id(),
            payload,
            spec,
            created_at: Utc::now(),
        }
    }

    pub fn size(&self) -> u32 {
        self.payload.size
    }
}
