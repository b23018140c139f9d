//! Application state for one compression run.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ghostpress::engine::result_extension;
use ghostpress::{
    load_config, CompressionSettings, GhostpressConfig, JobId, JobStatus, MediaKind,
    Orchestrator, SourceFile,
};
use log::{debug, info, warn};
use walkdir::WalkDir;

/// Settings given on the command line, applied over the config defaults.
#[derive(Debug, Default, Clone)]
pub struct SettingsOverrides {
    pub quality: Option<u8>,
    pub format: Option<String>,
    pub keep_metadata: bool,
    pub scale: Option<f32>,
}

impl SettingsOverrides {
    pub fn apply(&self, defaults: &mut CompressionSettings) {
        if let Some(quality) = self.quality {
            defaults.quality = quality;
        }
        if let Some(format) = &self.format {
            defaults.target_format = format.clone();
        }
        if self.keep_metadata {
            defaults.strip_metadata = false;
        }
        if self.scale.is_some() {
            defaults.scale = self.scale;
        }
    }
}

pub struct AppState {
    pub config: GhostpressConfig,
    pub orchestrator: Arc<Orchestrator>,
    /// Where results are written. Next to each source when unset.
    pub output_dir: Option<PathBuf>,
    sources: Vec<(JobId, PathBuf)>,
}

impl AppState {
    pub fn new(config: GhostpressConfig, output_dir: Option<PathBuf>) -> Self {
        let orchestrator = Arc::new(Orchestrator::from_config(&config));
        Self {
            config,
            orchestrator,
            output_dir,
            sources: Vec::new(),
        }
    }

    /// Loads the config file if given, otherwise the built-in defaults.
    pub fn load_config(path: Option<&Path>, overrides: &SettingsOverrides) -> Result<GhostpressConfig> {
        let mut config = match path {
            Some(path) => load_config(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => GhostpressConfig::default(),
        };
        overrides.apply(&mut config.defaults);
        config
            .defaults
            .validate()
            .context("Invalid compression settings")?;
        Ok(config)
    }

    /// Reads every supported file under `paths` and submits it.
    pub fn submit_paths(&mut self, paths: &[PathBuf]) -> Result<usize> {
        let files = collect_inputs(paths);
        if files.is_empty() {
            return Ok(0);
        }

        let store = self.orchestrator.store();
        let mut accepted = 0;
        for path in files {
            let bytes = fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let report = store.submit(vec![SourceFile::new(name, None, bytes)]);
            for rejected in &report.rejected {
                warn!("Skipping {}", rejected);
            }
            for id in report.accepted {
                self.sources.push((id, path.clone()));
                accepted += 1;
            }
        }
        info!("Submitted {} file(s)", accepted);
        Ok(accepted)
    }

    /// Writes the result of every completed job. Returns the written paths.
    pub fn write_results(&self) -> Result<Vec<PathBuf>> {
        let store = self.orchestrator.store();
        if let Some(dir) = &self.output_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        }

        let mut written = Vec::new();
        let mut taken = HashSet::new();
        for (id, source) in &self.sources {
            let Some(job) = store.get(*id) else { continue };
            if job.status != JobStatus::Completed {
                continue;
            }
            let Some(bytes) = store.result_bytes(*id) else { continue };

            let extension = result_extension(&job.name, job.media_kind, &job.settings);
            let target = result_path(self.output_dir.as_deref(), source, &extension, &mut taken);
            fs::write(&target, bytes.as_slice())
                .with_context(|| format!("Failed to write {}", target.display()))?;
            debug!("Wrote {}", target.display());
            written.push(target);
        }
        Ok(written)
    }
}

/// `<stem>.min.<ext>` next to the source or in `output_dir`.
///
/// Names already handed out in this run get a `-2`, `-3`, ... suffix, so
/// `a.png` and `a.jpg` converted to the same format do not overwrite each
/// other.
pub fn result_path(
    output_dir: Option<&Path>,
    source: &Path,
    extension: &str,
    taken: &mut HashSet<PathBuf>,
) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => source.parent().map(Path::to_path_buf).unwrap_or_default(),
    };

    let mut candidate = dir.join(format!("{}.min.{}", stem, extension));
    let mut n = 2;
    while taken.contains(&candidate) {
        candidate = dir.join(format!("{}-{}.min.{}", stem, n, extension));
        n += 1;
    }
    if n > 2 {
        warn!(
            "{} would collide with another result, writing {}",
            source.display(),
            candidate.display()
        );
    }
    taken.insert(candidate.clone());
    candidate
}

/// Expands directories and keeps files that look like images or videos.
pub fn collect_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if is_media(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        } else if path.is_file() {
            // Explicit files are passed through; the store reports unsupported ones.
            files.push(path.clone());
        } else {
            warn!("Input not found: {}", path.display());
        }
    }
    files
}

fn is_media(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    // Skip our own output.
    if name.contains(".min.") {
        return false;
    }
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    MediaKind::detect(mime.essence_str(), &name).is_supported()
}
