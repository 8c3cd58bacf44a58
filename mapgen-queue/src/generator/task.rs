//! Execution of a single generation job.
//!
//! Runs synchronously on a blocking thread. Every failure is returned as a
//! [`GenerationError`]; recording the outcome is the caller's job.

use serde_json::Value;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::validation::{self, MAX_SETTING_LENGTH};
use super::{CustomSchemas, GeneratedMap, MapGenerator, MapRequest, ProviderInfo};
use crate::config::DataPaths;
use crate::error::GenerationError;
use crate::queue::Job;
use crate::session::SessionId;

/// Runtime settings shared by every job.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub paths: DataPaths,
    pub public_mode: bool,
    pub public_max_map_size: u32,
}

/// Files produced by a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    /// Working directory of the job.
    pub directory: PathBuf,
    /// The artifact handed to the client.
    pub file_path: PathBuf,
    pub previews: Vec<PathBuf>,
}

/// Run a job against the generator and collect its artifact.
pub fn run_generation(
    generator: &dyn MapGenerator,
    job: &Job,
    ctx: &GenerationContext,
) -> Result<GenerationOutput, GenerationError> {
    let payload = &job.payload;
    let session = &job.session;

    info!(
        session = %session,
        game = %payload.game,
        dtm_code = %payload.dtm_code,
        size = payload.size,
        output_size = ?payload.output_size,
        rotation = payload.rotation,
        is_public = payload.is_public,
        has_custom_osm = payload.overlays.osm_xml.is_some() || payload.overlays.osm_path.is_some(),
        has_custom_dem = payload.overlays.dem_path.is_some(),
        "Starting generation task"
    );

    let provider = generator
        .provider(&payload.dtm_code)
        .ok_or_else(|| GenerationError::UnknownProvider(payload.dtm_code.clone()))?;
    let provider_settings = prepare_provider_settings(generator, &provider, payload.dtm_settings.as_ref())?;

    let directory = ctx.paths.working_dir(session);
    std::fs::create_dir_all(&directory)?;

    let custom_osm = resolve_custom_osm(job, &ctx.paths)?;
    let custom_dem = payload
        .overlays
        .dem_path
        .as_deref()
        .map(|name| {
            validation::resolve_user_file(&ctx.paths.dem_defaults_dir, name)
                .map_err(|e| GenerationError::custom_asset("DEM path", e))
        })
        .transpose()?;

    let game = payload.game.as_ref();
    let schemas = CustomSchemas {
        texture: load_schema(&ctx.paths, game, "texture", payload.overlays.texture_schema_path.as_deref())?,
        tree: load_schema(&ctx.paths, game, "tree", payload.overlays.tree_schema_path.as_deref())?,
        buildings: load_schema(
            &ctx.paths,
            game,
            "buildings",
            payload.overlays.buildings_schema_path.as_deref(),
        )?,
    };

    let custom_template = payload
        .overlays
        .map_template_path
        .as_deref()
        .map(|name| {
            validation::resolve_user_file(&ctx.paths.map_template_dir(game), name)
                .map_err(|e| GenerationError::custom_asset("map template path", e))
        })
        .transpose()?;

    let request = MapRequest {
        game: payload.game,
        provider,
        provider_settings,
        coordinates: payload.coordinates,
        size: payload.size,
        rotation: payload.rotation,
        output_size: payload.output_size,
        is_public: payload.is_public,
        map_directory: directory.clone(),
        components: job.spec.components.clone(),
        settings: payload.settings.clone(),
        custom_osm,
        custom_dem,
        custom_template,
        schemas,
    };

    let mut map = generator.create_map(request)?;

    if ctx.public_mode {
        enforce_public_limits(map.as_ref(), ctx.public_max_map_size)?;
    }

    for step in map.generate() {
        let message = step?;
        debug!(session = %session, "{}", message);
    }

    let previews = map.previews();
    let outputs = collect_outputs(map.as_ref(), job, &ctx.paths)?;
    debug!(session = %session, ?outputs, "Generated outputs");

    let file_path = match outputs.as_slice() {
        [] => return Err(GenerationError::NoOutputs),
        [single] => single.clone(),
        many => {
            let archive = directory.join(format!("{}.zip", session.as_str()));
            files_to_archive(many, &archive)?;
            archive
        }
    };

    info!(session = %session, output = %file_path.display(), "Generation task completed");

    Ok(GenerationOutput {
        directory,
        file_path,
        previews,
    })
}

fn prepare_provider_settings(
    generator: &dyn MapGenerator,
    provider: &ProviderInfo,
    settings: Option<&Value>,
) -> Result<Option<Value>, GenerationError> {
    let settings = settings.filter(|s| !is_empty_settings(s));

    if !provider.settings_required {
        return Ok(settings.cloned());
    }

    let settings = settings.ok_or(GenerationError::MissingProviderSettings)?;
    validation::sanitize_settings(settings, MAX_SETTING_LENGTH).map_err(|e| {
        warn!(provider = %provider.code, error = %e, "Provider settings rejected");
        GenerationError::InvalidProviderSettings(e.to_string())
    })?;
    generator
        .validate_provider_settings(provider, settings)
        .map_err(GenerationError::InvalidProviderSettings)?;
    Ok(Some(settings.clone()))
}

fn is_empty_settings(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn resolve_custom_osm(job: &Job, paths: &DataPaths) -> Result<Option<PathBuf>, GenerationError> {
    let overlays = &job.payload.overlays;

    if let Some(xml) = &overlays.osm_xml {
        let path = paths.custom_osm_file(&job.session);
        save_custom_osm(xml, &path)?;
        return Ok(Some(path));
    }

    overlays
        .osm_path
        .as_deref()
        .map(|name| {
            let path = validation::resolve_user_file(&paths.osm_defaults_dir, name)
                .map_err(|e| GenerationError::custom_asset("OSM path", e))?;
            info!(path = %path.display(), "Using custom OSM file");
            Ok(path)
        })
        .transpose()
}

fn save_custom_osm(xml: &str, path: &Path) -> Result<(), GenerationError> {
    let write = || -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, xml)
    };
    write().map_err(|e| GenerationError::generator(format!("Error saving OSM data: {}", e)))?;
    debug!(path = %path.display(), "Saved custom OSM data");
    Ok(())
}

fn load_schema(
    paths: &DataPaths,
    game: &str,
    kind: &'static str,
    name: Option<&str>,
) -> Result<Option<Vec<Value>>, GenerationError> {
    let Some(name) = name else {
        return Ok(None);
    };

    let path = validation::resolve_user_file(&paths.schema_dir(game, kind), name)
        .map_err(|e| GenerationError::custom_asset("schema path", e))?;

    let invalid = |reason: String| GenerationError::InvalidSchema { kind, reason };
    let raw = std::fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
    let value: Value = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;

    match value {
        Value::Array(items) if !items.is_empty() => {
            info!(kind, path = %path.display(), "Loaded custom schema");
            Ok(Some(items))
        }
        Value::Array(_) | Value::Null => Err(invalid(format!("file is empty: {}", path.display()))),
        _ => Err(invalid(format!("file is not a valid list: {}", path.display()))),
    }
}

fn enforce_public_limits(map: &dyn GeneratedMap, limit: u32) -> Result<(), GenerationError> {
    let size = map.size();
    if size > limit {
        warn!(size, limit, "Map size exceeds public limit, stopping generation");
        return Err(GenerationError::SizeLimitExceeded { size, limit });
    }
    if let Some(size) = map.output_size()
        && size > limit
    {
        warn!(size, limit, "Output size exceeds public limit, stopping generation");
        return Err(GenerationError::OutputSizeLimitExceeded { size, limit });
    }
    Ok(())
}

fn collect_outputs(
    map: &dyn GeneratedMap,
    job: &Job,
    paths: &DataPaths,
) -> Result<Vec<PathBuf>, GenerationError> {
    let spec = &job.spec;

    if spec.include_all || spec.components.is_empty() {
        debug!(session = %job.session, "Packing every component");
        let expected = paths.archive_path(&job.session);
        let archive = map.pack(&expected)?;
        if archive != expected {
            return Err(GenerationError::Archive {
                path: archive.display().to_string(),
                reason: format!("expected the package at {}", expected.display()),
            });
        }
        return Ok(vec![archive]);
    }

    let mut outputs = Vec::new();
    for component in &spec.components {
        let Some(assets) = map.component_assets(component) else {
            warn!(component = %component, "Component not found in the map");
            continue;
        };

        if spec.assets.is_empty() {
            outputs.extend(assets.into_values());
        } else {
            outputs.extend(spec.assets.iter().filter_map(|name| assets.get(name).cloned()));
        }
    }
    Ok(outputs)
}

/// Bundle files into a flat zip archive. Missing files are skipped.
fn files_to_archive(files: &[PathBuf], archive_path: &Path) -> Result<(), GenerationError> {
    let archive_err = |reason: String| GenerationError::Archive {
        path: archive_path.display().to_string(),
        reason,
    };

    let file = File::create(archive_path).map_err(|e| archive_err(e.to_string()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for path in files.iter().filter(|p| p.is_file()) {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let buffer = std::fs::read(path).map_err(|e| archive_err(e.to_string()))?;

        zip.start_file(&name, options)
            .map_err(|e| archive_err(e.to_string()))?;
        zip.write_all(&buffer)
            .map_err(|e| archive_err(e.to_string()))?;
    }

    zip.finish().map_err(|e| archive_err(e.to_string()))?;
    Ok(())
}

/// Working directory a job writes to, if it was ever created.
pub fn existing_working_dir(paths: &DataPaths, session: &SessionId) -> Option<PathBuf> {
    let dir = paths.working_dir(session);
    dir.exists().then_some(dir)
}
