use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::domain::{
    CheckOutcome, ConvertStats, ExpectedFile, GenerateStats, ModelDescriptor, Platform,
    SkipReason, VerifyStats, CONVERTED_SAMPLE_NAME, expected_output_path, format_macro_line,
    has_image_extension, local_file_name,
};

#[derive(Debug, thiserror::Error)]
pub enum CiError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("tiff error: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error("model not found in repository: {0}")]
    ModelNotFound(String),
    #[error("{0}")]
    Message(String),
}

/// Remote store of packaged models.
pub trait ModelRepository: Send + Sync {
    /// Downloads the model and returns the directory holding its `rdf.yaml`.
    fn download(&self, identifier: &str, models_dir: &Path) -> Result<PathBuf, CiError>;
}

pub trait FilePorts: Send + Sync {
    /// Size of a regular file, `None` when the path is missing or not a file.
    fn regular_file_size(&self, path: &Path) -> Result<Option<u64>, CiError>;
    fn ensure_dir(&self, dir: &Path) -> Result<(), CiError>;
    fn open_append(&self, path: &Path) -> Result<Box<dyn Write>, CiError>;
    fn read_manifest(&self, path: &Path) -> Result<Vec<ExpectedFile>, CiError>;
    fn write_manifest(&self, path: &Path, entries: &[ExpectedFile]) -> Result<(), CiError>;
    fn read_descriptor(&self, model_dir: &Path) -> Result<ModelDescriptor, CiError>;
    fn list_files_in_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, CiError>;
    fn npy_to_tiff(&self, source: &Path, target: &Path, axes: &str) -> Result<(), CiError>;
    fn tiff_to_npy(&self, source: &Path, target: &Path) -> Result<(), CiError>;
}

pub trait VerifyReporter: Send + Sync {
    fn on_start(&self, manifest: &Path, entries: usize);
    fn on_check(&self, outcome: &CheckOutcome);
    fn on_finish(&self, stats: &VerifyStats);
}

pub trait GenerateReporter: Send + Sync {
    fn on_download(&self, identifier: &str);
    fn on_downloaded(&self, identifier: &str, model_dir: &Path);
    fn on_converted(&self, source: &Path, target: &Path);
    fn on_skip(&self, identifier: &str, reason: &SkipReason);
    fn on_macro(&self, line: &str);
    fn on_finish(&self, stats: &GenerateStats);
}

pub trait ConvertReporter: Send + Sync {
    fn on_converted(&self, source: &Path, target: &Path);
    fn on_failed(&self, source: &Path, reason: &str);
    fn on_finish(&self, stats: &ConvertStats);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub outcomes: Vec<CheckOutcome>,
    pub stats: VerifyStats,
}

pub fn verify_outputs(
    ports: &dyn FilePorts,
    progress: &dyn VerifyReporter,
    manifest: &Path,
) -> Result<VerifyReport, CiError> {
    let entries = ports.read_manifest(manifest)?;
    progress.on_start(manifest, entries.len());

    // stat concurrently, report in manifest order
    let outcomes = entries
        .par_iter()
        .map(|entry| {
            let size = ports.regular_file_size(Path::new(&entry.path))?;
            Ok(CheckOutcome::evaluate(entry, size))
        })
        .collect::<Result<Vec<_>, CiError>>()?;

    let mut stats = VerifyStats::default();
    for outcome in &outcomes {
        stats.checked += 1;
        if outcome.is_failure() {
            stats.failed += 1;
        }
        progress.on_check(outcome);
    }

    progress.on_finish(&stats);
    Ok(VerifyReport { outcomes, stats })
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub identifiers: Vec<String>,
    pub models_dir: PathBuf,
    pub macro_path: PathBuf,
    pub manifest_path: PathBuf,
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateReport {
    pub expected: Vec<ExpectedFile>,
    pub stats: GenerateStats,
}

enum SampleInput {
    Existing(PathBuf),
    Converted(PathBuf),
}

fn resolve_sample_input(
    ports: &dyn FilePorts,
    model_dir: &Path,
    descriptor: &ModelDescriptor,
) -> Result<Option<SampleInput>, CiError> {
    if let Some(sample) = descriptor.sample_input_name() {
        let sample_path = model_dir.join(local_file_name(sample));
        if has_image_extension(&sample_path) && ports.regular_file_size(&sample_path)?.is_some() {
            return Ok(Some(SampleInput::Existing(sample_path)));
        }
    }

    let Some(test) = descriptor.test_input_name() else {
        return Ok(None);
    };
    let test_path = model_dir.join(local_file_name(test));
    if ports.regular_file_size(&test_path)?.is_none() {
        return Ok(None);
    }

    let converted = model_dir.join(CONVERTED_SAMPLE_NAME);
    ports.npy_to_tiff(&test_path, &converted, &descriptor.input_axes())?;
    Ok(Some(SampleInput::Converted(converted)))
}

/// Downloads every model, appends one macro line per runnable model and writes the manifest
/// of outputs the macros are expected to produce.
pub fn generate_macros(
    repository: &dyn ModelRepository,
    ports: &dyn FilePorts,
    progress: &dyn GenerateReporter,
    request: &GenerateRequest,
) -> Result<GenerateReport, CiError> {
    let mut stats = GenerateStats::default();
    let mut expected = Vec::new();

    ports.ensure_dir(&request.models_dir)?;
    let mut macro_file = ports.open_append(&request.macro_path)?;

    for identifier in &request.identifiers {
        stats.requested += 1;
        progress.on_download(identifier);
        let model_dir = repository.download(identifier, &request.models_dir)?;
        stats.downloaded += 1;
        progress.on_downloaded(identifier, &model_dir);

        let descriptor = ports.read_descriptor(&model_dir)?;
        if !request.platform.supports_any(&descriptor) {
            stats.skipped += 1;
            let reason = SkipReason::UnsupportedPlatform {
                formats: descriptor.weight_keys(),
            };
            progress.on_skip(identifier, &reason);
            continue;
        }

        let input_path = match resolve_sample_input(ports, &model_dir, &descriptor)? {
            Some(SampleInput::Existing(path)) => path,
            Some(SampleInput::Converted(path)) => {
                stats.converted += 1;
                if let Some(test) = descriptor.test_input_name() {
                    progress.on_converted(&model_dir.join(local_file_name(test)), &path);
                }
                path
            }
            None => {
                stats.skipped += 1;
                progress.on_skip(identifier, &SkipReason::NoSampleInput);
                continue;
            }
        };

        let model_path = model_dir.to_string_lossy();
        let line = format_macro_line(&model_path, &input_path.to_string_lossy(), &model_path);
        writeln!(macro_file, "{line}")?;
        stats.macros_written += 1;
        progress.on_macro(&line);

        for tensor_name in descriptor.output_tensor_names() {
            let output = expected_output_path(&model_dir, &input_path, tensor_name);
            expected.push(ExpectedFile::new(output.to_string_lossy()));
            stats.expected_outputs += 1;
        }
    }

    macro_file.flush()?;
    ports.write_manifest(&request.manifest_path, &expected)?;
    progress.on_finish(&stats);

    Ok(GenerateReport { expected, stats })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertDirection {
    NpyToTiff,
    TiffToNpy,
}

impl ConvertDirection {
    pub fn from_paths(source: &Path, target: &Path) -> Option<Self> {
        let ext = |path: &Path| {
            path.extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        };
        match (ext(source).as_deref(), ext(target).as_deref()) {
            (Some("npy"), Some("tif" | "tiff")) => Some(ConvertDirection::NpyToTiff),
            (Some("tif" | "tiff"), Some("npy")) => Some(ConvertDirection::TiffToNpy),
            _ => None,
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        let matches_any = |exts: &[&str]| {
            path.extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
                .is_some_and(|ext| exts.contains(&ext.as_str()))
        };
        match self {
            ConvertDirection::NpyToTiff => matches_any(&["npy"]),
            ConvertDirection::TiffToNpy => matches_any(&["tif", "tiff"]),
        }
    }

    fn target_extension(&self) -> &'static OsStr {
        match self {
            ConvertDirection::NpyToTiff => OsStr::new("tif"),
            ConvertDirection::TiffToNpy => OsStr::new("npy"),
        }
    }
}

pub fn convert_file(
    ports: &dyn FilePorts,
    direction: ConvertDirection,
    source: &Path,
    target: &Path,
    axes: &str,
) -> Result<(), CiError> {
    match direction {
        ConvertDirection::NpyToTiff => ports.npy_to_tiff(source, target, axes),
        ConvertDirection::TiffToNpy => ports.tiff_to_npy(source, target),
    }
}

/// Converts every matching file of `source_dir` into `target_dir`; failures are reported per
/// file and do not stop the batch.
pub fn convert_directory(
    ports: &dyn FilePorts,
    progress: &dyn ConvertReporter,
    direction: ConvertDirection,
    source_dir: &Path,
    target_dir: &Path,
    axes: &str,
) -> Result<ConvertStats, CiError> {
    ports.ensure_dir(target_dir)?;

    let mut sources: Vec<PathBuf> = ports
        .list_files_in_dir(source_dir)?
        .into_iter()
        .filter(|path| direction.accepts(path))
        .collect();
    sources.sort();

    let results: Vec<(PathBuf, PathBuf, Result<(), CiError>)> = sources
        .into_par_iter()
        .map(|source| {
            let file_name = source.file_name().map(Path::new).unwrap_or(Path::new(""));
            let target = target_dir.join(file_name.with_extension(direction.target_extension()));
            let result = convert_file(ports, direction, &source, &target, axes);
            (source, target, result)
        })
        .collect();

    let mut stats = ConvertStats::default();
    for (source, target, result) in results {
        stats.files_seen += 1;
        match result {
            Ok(()) => {
                stats.converted += 1;
                progress.on_converted(&source, &target);
            }
            Err(err) => {
                stats.failed += 1;
                progress.on_failed(&source, &err.to_string());
            }
        }
    }

    progress.on_finish(&stats);
    Ok(stats)
}
