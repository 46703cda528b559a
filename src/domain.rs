use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const RDF_FILE_NAME: &str = "rdf.yaml";
pub const CONVERTED_SAMPLE_NAME: &str = "sample_input_0.tif";
pub const OUTPUT_EXTENSION: &str = "tif";
pub const DEFAULT_MIN_SIZE: u64 = 1;
pub const DEFAULT_COLLECTION_URL: &str =
    "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/collection.json";

const IMAGE_EXTENSIONS: [&str; 5] = ["tif", "tiff", "png", "jpg", "jpeg"];

fn default_min_size() -> u64 {
    DEFAULT_MIN_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedFile {
    pub path: String,
    #[serde(default = "default_min_size")]
    pub min_size: u64,
}

impl ExpectedFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            min_size: DEFAULT_MIN_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Found { path: String, actual: u64 },
    Missing { path: String },
    TooSmall { path: String, actual: u64, min: u64 },
}

impl CheckOutcome {
    pub fn evaluate(expected: &ExpectedFile, actual_size: Option<u64>) -> Self {
        let path = expected.path.clone();
        match actual_size {
            None => CheckOutcome::Missing { path },
            Some(actual) if actual < expected.min_size => CheckOutcome::TooSmall {
                path,
                actual,
                min: expected.min_size,
            },
            Some(actual) => CheckOutcome::Found { path, actual },
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, CheckOutcome::Found { .. })
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckOutcome::Found { path, actual } => {
                write!(f, "File '{path}' exists with size {actual} bytes.")
            }
            CheckOutcome::Missing { path } => {
                write!(f, "Error: Expected file '{path}' not found.")
            }
            CheckOutcome::TooSmall { path, actual, min } => write!(
                f,
                "Error: File '{path}' size {actual} bytes is less than expected {min} bytes."
            ),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifyStats {
    pub checked: u64,
    pub failed: u64,
}

impl VerifyStats {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GenerateStats {
    pub requested: u64,
    pub downloaded: u64,
    pub skipped: u64,
    pub converted: u64,
    pub macros_written: u64,
    pub expected_outputs: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConvertStats {
    pub files_seen: u64,
    pub converted: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnsupportedPlatform { formats: Vec<String> },
    NoSampleInput,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsupportedPlatform { formats } if formats.is_empty() => {
                write!(f, "no weights declared")
            }
            SkipReason::UnsupportedPlatform { formats } => write!(
                f,
                "no runtime for [{}] on this platform",
                formats.join(", ")
            ),
            SkipReason::NoSampleInput => write!(f, "no sample input and no test input"),
        }
    }
}

/// Splits a comma separated identifier list, dropping blanks.
pub fn parse_model_identifiers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .collect()
}

/// The host macro parser treats spaces as argument separators unless the value is bracketed.
pub fn quote_macro_path(path: &str) -> String {
    if path.contains(' ') {
        format!("[{path}]")
    } else {
        path.to_owned()
    }
}

pub fn format_macro_line(model_path: &str, input_path: &str, output_folder: &str) -> String {
    format!(
        "run(\"DeepImageJ Run\", \"modelPath={} inputPath={} outputFolder={} displayOutput=null\")",
        quote_macro_path(model_path),
        quote_macro_path(input_path),
        quote_macro_path(output_folder)
    )
}

pub fn expected_output_path(output_folder: &Path, input_path: &Path, tensor_name: &str) -> PathBuf {
    let stem = input_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_folder.join(format!("{stem}_{tensor_name}.{OUTPUT_EXTENSION}"))
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_remote_source(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Name a referenced file has once it sits in the model directory.
pub fn local_file_name(source: &str) -> &str {
    if !is_remote_source(source) {
        return source;
    }
    let without_query = source.split(['?', '#']).next().unwrap_or(source);
    let path = without_query.trim_end_matches('/');
    // record stores serve `.../files/<name>/content`
    let path = path.strip_suffix("/content").unwrap_or(path);
    path.rsplit('/').next().unwrap_or(path)
}

/// `source` of a reference written either as a bare string or as `{source: ..}`.
fn value_source(value: &serde_yaml::Value) -> Option<&str> {
    match value {
        serde_yaml::Value::String(source) => Some(source.as_str()),
        serde_yaml::Value::Mapping(_) => value.get("source").and_then(serde_yaml::Value::as_str),
        _ => None,
    }
}

/// Replaces characters that are unsafe in folder names; spaces are kept.
pub fn sanitize_folder_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "model".to_owned()
    } else {
        sanitized
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FileRef {
    Path(String),
    Descr { source: String },
}

impl FileRef {
    pub fn source(&self) -> &str {
        match self {
            FileRef::Path(source) => source,
            FileRef::Descr { source } => source,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AxisEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
}

impl AxisEntry {
    fn letter(&self) -> char {
        match self.kind.as_str() {
            "batch" => 'b',
            "channel" => 'c',
            "index" => 'i',
            "time" => 't',
            _ => self
                .id
                .as_deref()
                .and_then(|id| id.chars().next())
                .unwrap_or('?'),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Axes {
    Letters(String),
    Entries(Vec<AxisEntry>),
}

impl Default for Axes {
    fn default() -> Self {
        Axes::Letters(String::new())
    }
}

impl Axes {
    pub fn letters(&self) -> String {
        match self {
            Axes::Letters(letters) => letters.to_ascii_lowercase(),
            Axes::Entries(entries) => entries.iter().map(AxisEntry::letter).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TensorDescriptor {
    #[serde(alias = "id")]
    pub name: String,
    #[serde(default)]
    pub axes: Axes,
    #[serde(default)]
    pub test_tensor: Option<FileRef>,
    #[serde(default)]
    pub sample_tensor: Option<FileRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightsEntry {
    pub source: String,
    #[serde(default)]
    pub tensorflow_version: Option<serde_yaml::Value>,
    #[serde(default)]
    pub architecture: Option<serde_yaml::Value>,
    #[serde(default)]
    pub dependencies: Option<serde_yaml::Value>,
}

impl WeightsEntry {
    /// Model code and environment files loaded next to the weights.
    fn companion_files(&self) -> impl Iterator<Item = &str> {
        let architecture = self
            .architecture
            .as_ref()
            .and_then(value_source)
            .map(|source| match source.rsplit_once(':') {
                // 0.4 writes `file.py:ClassName`
                Some((file, _)) if file.ends_with(".py") => file,
                _ => source,
            })
            .filter(|file| file.ends_with(".py"));
        let dependencies = self
            .dependencies
            .as_ref()
            .and_then(value_source)
            .map(|source| {
                source
                    .strip_prefix("conda:")
                    .or_else(|| source.strip_prefix("pip:"))
                    .unwrap_or(source)
            });
        architecture.into_iter().chain(dependencies)
    }

    fn tensorflow_major(&self) -> Option<u32> {
        match self.tensorflow_version.as_ref()? {
            serde_yaml::Value::String(version) => version.split('.').next()?.trim().parse().ok(),
            serde_yaml::Value::Number(version) => version.as_f64().map(|v| v.trunc() as u32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    TorchScript,
    Onnx,
    TensorflowSavedModel { major: Option<u32> },
    KerasHdf5,
    PytorchStateDict,
    TensorflowJs,
    Unknown,
}

impl WeightFormat {
    fn from_entry(key: &str, entry: &WeightsEntry) -> Self {
        match key {
            "torchscript" | "pytorch_script" => WeightFormat::TorchScript,
            "onnx" => WeightFormat::Onnx,
            "tensorflow_saved_model_bundle" => WeightFormat::TensorflowSavedModel {
                major: entry.tensorflow_major(),
            },
            "keras_hdf5" => WeightFormat::KerasHdf5,
            "pytorch_state_dict" => WeightFormat::PytorchStateDict,
            "tensorflow_js" => WeightFormat::TensorflowJs,
            _ => WeightFormat::Unknown,
        }
    }
}

/// Subset of a bioimage.io resource description (format 0.4 and 0.5).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default)]
    pub inputs: Vec<TensorDescriptor>,
    #[serde(default)]
    pub outputs: Vec<TensorDescriptor>,
    #[serde(default)]
    pub test_inputs: Vec<String>,
    #[serde(default)]
    pub test_outputs: Vec<String>,
    #[serde(default)]
    pub sample_inputs: Vec<String>,
    #[serde(default)]
    pub sample_outputs: Vec<String>,
    #[serde(default)]
    pub weights: BTreeMap<String, Option<WeightsEntry>>,
    #[serde(default)]
    pub attachments: Option<serde_yaml::Value>,
    #[serde(default)]
    pub documentation: Option<String>,
    #[serde(default)]
    pub covers: Vec<String>,
}

impl ModelDescriptor {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn sample_input_name(&self) -> Option<&str> {
        self.inputs
            .first()
            .and_then(|input| input.sample_tensor.as_ref())
            .map(FileRef::source)
            .or_else(|| self.sample_inputs.first().map(String::as_str))
    }

    pub fn test_input_name(&self) -> Option<&str> {
        self.inputs
            .first()
            .and_then(|input| input.test_tensor.as_ref())
            .map(FileRef::source)
            .or_else(|| self.test_inputs.first().map(String::as_str))
    }

    pub fn input_axes(&self) -> String {
        self.inputs
            .first()
            .map(|input| input.axes.letters())
            .unwrap_or_default()
    }

    pub fn output_tensor_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|output| output.name.as_str()).collect()
    }

    pub fn weight_keys(&self) -> Vec<String> {
        self.weights
            .iter()
            .filter(|(_, entry)| entry.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn weight_formats(&self) -> Vec<WeightFormat> {
        self.weights
            .iter()
            .filter_map(|(key, entry)| entry.as_ref().map(|e| WeightFormat::from_entry(key, e)))
            .collect()
    }

    /// 0.4 nests attachments under `files`, 0.5 lists file descriptions directly.
    fn attachment_files(&self) -> Vec<&str> {
        let list = match &self.attachments {
            Some(serde_yaml::Value::Sequence(list)) => list,
            Some(attachments) => match attachments.get("files") {
                Some(serde_yaml::Value::Sequence(list)) => list,
                _ => return Vec::new(),
            },
            None => return Vec::new(),
        };
        list.iter().filter_map(value_source).collect()
    }

    /// Every file the description points at, without duplicates. Weight files come first,
    /// ordered by format key, followed by tensors, attachments, documentation and covers.
    pub fn referenced_files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        let mut push = |source: &str| {
            if !source.is_empty() && !files.iter().any(|f| f == source) {
                files.push(source.to_owned());
            }
        };

        for entry in self.weights.values().flatten() {
            push(entry.source.as_str());
            for file in entry.companion_files() {
                push(file);
            }
        }
        for tensor in self.inputs.iter().chain(self.outputs.iter()) {
            for file in [&tensor.test_tensor, &tensor.sample_tensor].into_iter().flatten() {
                push(file.source());
            }
        }
        for source in self
            .test_inputs
            .iter()
            .chain(&self.test_outputs)
            .chain(&self.sample_inputs)
            .chain(&self.sample_outputs)
        {
            push(source.as_str());
        }
        for source in self.attachment_files() {
            push(source);
        }
        for source in self.documentation.iter().chain(&self.covers) {
            push(source.as_str());
        }

        files
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn supports(&self, format: WeightFormat) -> bool {
        match format {
            WeightFormat::TorchScript | WeightFormat::Onnx => true,
            WeightFormat::TensorflowSavedModel { major: Some(1) } => self.arch != "aarch64",
            WeightFormat::TensorflowSavedModel { .. } => true,
            WeightFormat::KerasHdf5
            | WeightFormat::PytorchStateDict
            | WeightFormat::TensorflowJs
            | WeightFormat::Unknown => false,
        }
    }

    pub fn supports_any(&self, descriptor: &ModelDescriptor) -> bool {
        descriptor
            .weight_formats()
            .into_iter()
            .any(|format| self.supports(format))
    }
}

/// How an N-d array maps onto a stack of Y×X pages in ImageJ order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: usize,
    pub height: usize,
    strides: Vec<usize>,
    y_axis: usize,
    x_axis: usize,
    // outermost first
    page_axes: Vec<usize>,
    shape: Vec<usize>,
    channels: usize,
    slices: usize,
    frames: usize,
}

impl PlaneLayout {
    pub fn new(shape: &[usize], axes: &str, fortran_order: bool) -> Result<Self, String> {
        if shape.len() < 2 {
            return Err(format!("array of rank {} has no 2-d planes", shape.len()));
        }

        let letters: Vec<char> = axes.chars().collect();
        let letters = if letters.len() == shape.len()
            && letters.contains(&'y')
            && letters.contains(&'x')
        {
            letters
        } else {
            let mut fallback = vec!['?'; shape.len()];
            let rank = shape.len();
            fallback[rank - 2] = 'y';
            fallback[rank - 1] = 'x';
            fallback
        };

        let position = |letter: char| letters.iter().position(|&l| l == letter);
        let y_axis = position('y').ok_or("missing y axis")?;
        let x_axis = position('x').ok_or("missing x axis")?;

        let priority = |letter: char| match letter {
            'c' => 3,
            'z' => 2,
            't' => 1,
            _ => 0,
        };
        let mut page_axes: Vec<usize> = (0..shape.len())
            .filter(|&axis| axis != y_axis && axis != x_axis)
            .collect();
        page_axes.sort_by_key(|&axis| priority(letters[axis]));

        let (mut channels, mut slices, mut frames) = (1, 1, 1);
        // axes without a hyperstack slot count as frames
        for &axis in &page_axes {
            match letters[axis] {
                'c' => channels *= shape[axis],
                'z' => slices *= shape[axis],
                _ => frames *= shape[axis],
            }
        }

        let mut strides = vec![1usize; shape.len()];
        if fortran_order {
            for axis in 1..shape.len() {
                strides[axis] = strides[axis - 1] * shape[axis - 1];
            }
        } else {
            for axis in (0..shape.len() - 1).rev() {
                strides[axis] = strides[axis + 1] * shape[axis + 1];
            }
        }

        Ok(Self {
            width: shape[x_axis],
            height: shape[y_axis],
            strides,
            y_axis,
            x_axis,
            page_axes,
            shape: shape.to_vec(),
            channels,
            slices,
            frames,
        })
    }

    pub fn page_count(&self) -> usize {
        self.page_axes.iter().map(|&axis| self.shape[axis]).product()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    fn page_offset(&self, page: usize) -> usize {
        let mut remaining = page;
        let mut offset = 0;
        for &axis in self.page_axes.iter().rev() {
            let index = remaining % self.shape[axis];
            remaining /= self.shape[axis];
            offset += index * self.strides[axis];
        }
        offset
    }

    /// Copies one page out of `data` in row-major Y×X order.
    pub fn gather<T: Copy>(&self, data: &[T], page: usize) -> Vec<T> {
        let base = self.page_offset(page);
        let (y_stride, x_stride) = (self.strides[self.y_axis], self.strides[self.x_axis]);
        let mut plane = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                plane.push(data[base + y * y_stride + x * x_stride]);
            }
        }
        plane
    }

    pub fn imagej_description(&self) -> Option<String> {
        if self.page_count() <= 1 {
            return None;
        }
        Some(format!(
            "ImageJ=1.54f\nimages={}\nchannels={}\nslices={}\nframes={}\nhyperstack=true\n",
            self.page_count(),
            self.channels,
            self.slices,
            self.frames
        ))
    }
}
