use std::fs;
use std::io::{self, BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use npyz::WriterBuilder;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder, TiffValue};
use tiff::tags::Tag;
use walkdir::WalkDir;

use crate::application::{
    CiError, ConvertReporter, FilePorts, GenerateReporter, VerifyReporter,
};
use crate::domain::{
    CheckOutcome, ConvertStats, ExpectedFile, GenerateStats, ModelDescriptor, PlaneLayout,
    SkipReason, VerifyStats, RDF_FILE_NAME,
};

pub struct FsPorts;

impl FsPorts {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FsPorts {
    fn default() -> Self {
        Self::new()
    }
}

impl FilePorts for FsPorts {
    fn regular_file_size(&self, path: &Path) -> Result<Option<u64>, CiError> {
        // unreadable metadata counts as missing, like a failed isfile()
        Ok(fs::metadata(path)
            .ok()
            .filter(|metadata| metadata.is_file())
            .map(|metadata| metadata.len()))
    }

    fn ensure_dir(&self, dir: &Path) -> Result<(), CiError> {
        if !dir.is_dir() {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn open_append(&self, path: &Path) -> Result<Box<dyn Write>, CiError> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn read_manifest(&self, path: &Path) -> Result<Vec<ExpectedFile>, CiError> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    fn write_manifest(&self, path: &Path, entries: &[ExpectedFile]) -> Result<(), CiError> {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, entries)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }

    fn read_descriptor(&self, model_dir: &Path) -> Result<ModelDescriptor, CiError> {
        let text = fs::read_to_string(model_dir.join(RDF_FILE_NAME))?;
        Ok(ModelDescriptor::from_yaml(&text)?)
    }

    fn list_files_in_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, CiError> {
        let mut files = Vec::new();

        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|err| CiError::Message(err.to_string()))?;

            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        Ok(files)
    }

    fn npy_to_tiff(&self, source: &Path, target: &Path, axes: &str) -> Result<(), CiError> {
        let array = read_npy(source)?;
        let layout = PlaneLayout::new(&array.shape, axes, array.fortran_order)
            .map_err(|reason| CiError::Message(format!("{}: {reason}", source.display())))?;
        if layout.element_count() != array.samples.len() {
            return Err(CiError::Message(format!(
                "{}: shape {:?} does not match {} stored values",
                source.display(),
                array.shape,
                array.samples.len()
            )));
        }
        write_tiff(target, &layout, &array.samples)
    }

    fn tiff_to_npy(&self, source: &Path, target: &Path) -> Result<(), CiError> {
        let (shape, samples) = read_tiff(source)?;
        write_npy(target, &shape, &samples)
    }
}

/// Pixel data narrowed to the sample types ImageJ opens natively.
#[derive(Debug, Clone, PartialEq)]
enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}

impl Samples {
    fn len(&self) -> usize {
        match self {
            Samples::U8(values) => values.len(),
            Samples::U16(values) => values.len(),
            Samples::F32(values) => values.len(),
        }
    }

    fn append(&mut self, other: Samples) -> Result<(), CiError> {
        match (self, other) {
            (Samples::U8(all), Samples::U8(page)) => all.extend(page),
            (Samples::U16(all), Samples::U16(page)) => all.extend(page),
            (Samples::F32(all), Samples::F32(page)) => all.extend(page),
            _ => {
                return Err(CiError::Message(
                    "tiff pages do not share a sample type".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

fn to_f32<T: Copy>(values: Vec<T>, cast: impl Fn(T) -> f32) -> Samples {
    Samples::F32(values.into_iter().map(cast).collect())
}

struct NpyArray {
    shape: Vec<usize>,
    fortran_order: bool,
    samples: Samples,
}

fn read_npy(path: &Path) -> Result<NpyArray, CiError> {
    let npy = npyz::NpyFile::new(BufReader::new(fs::File::open(path)?))?;
    let shape: Vec<usize> = npy.shape().iter().map(|&dim| dim as usize).collect();
    let fortran_order = matches!(npy.order(), npyz::Order::Fortran);

    let type_str = match npy.dtype() {
        npyz::DType::Plain(type_str) => type_str.to_string(),
        other => {
            return Err(CiError::Message(format!(
                "{}: unsupported npy dtype {}",
                path.display(),
                other.descr()
            )));
        }
    };

    // first character is the byte order marker
    let samples = match type_str.get(1..).unwrap_or_default() {
        "u1" => Samples::U8(npy.into_vec::<u8>()?),
        "b1" => Samples::U8(npy.into_vec::<bool>()?.into_iter().map(u8::from).collect()),
        "u2" => Samples::U16(npy.into_vec::<u16>()?),
        "f4" => Samples::F32(npy.into_vec::<f32>()?),
        "f8" => to_f32(npy.into_vec::<f64>()?, |v| v as f32),
        "i1" => to_f32(npy.into_vec::<i8>()?, f32::from),
        "i2" => to_f32(npy.into_vec::<i16>()?, f32::from),
        "i4" => to_f32(npy.into_vec::<i32>()?, |v| v as f32),
        "i8" => to_f32(npy.into_vec::<i64>()?, |v| v as f32),
        "u4" => to_f32(npy.into_vec::<u32>()?, |v| v as f32),
        "u8" => to_f32(npy.into_vec::<u64>()?, |v| v as f32),
        other => {
            return Err(CiError::Message(format!(
                "{}: unsupported npy type {other}",
                path.display()
            )));
        }
    };

    Ok(NpyArray {
        shape,
        fortran_order,
        samples,
    })
}

fn write_tiff(path: &Path, layout: &PlaneLayout, samples: &Samples) -> Result<(), CiError> {
    if layout.width == 0 || layout.height == 0 || layout.page_count() == 0 {
        return Err(CiError::Message(format!(
            "{}: cannot write an empty image",
            path.display()
        )));
    }

    let mut encoder = TiffEncoder::new(BufWriter::new(fs::File::create(path)?))?;
    match samples {
        Samples::U8(data) => write_pages::<colortype::Gray8, _>(&mut encoder, layout, data),
        Samples::U16(data) => write_pages::<colortype::Gray16, _>(&mut encoder, layout, data),
        Samples::F32(data) => {
            write_pages::<colortype::Gray32Float, _>(&mut encoder, layout, data)
        }
    }
}

fn write_pages<C, W>(
    encoder: &mut TiffEncoder<W>,
    layout: &PlaneLayout,
    data: &[C::Inner],
) -> Result<(), CiError>
where
    C: colortype::ColorType,
    C::Inner: Copy,
    [C::Inner]: TiffValue,
    W: Write + Seek,
{
    let width = u32::try_from(layout.width)
        .map_err(|_| CiError::Message(format!("width {} too large", layout.width)))?;
    let height = u32::try_from(layout.height)
        .map_err(|_| CiError::Message(format!("height {} too large", layout.height)))?;
    let description = layout.imagej_description();

    for page in 0..layout.page_count() {
        let plane = layout.gather(data, page);
        let mut image = encoder.new_image::<C>(width, height)?;
        if page == 0 {
            if let Some(description) = &description {
                image
                    .encoder()
                    .write_tag(Tag::ImageDescription, description.as_str())?;
            }
        }
        image.write_data(&plane)?;
    }

    Ok(())
}

fn decode_page(result: DecodingResult) -> Samples {
    match result {
        DecodingResult::U8(values) => Samples::U8(values),
        DecodingResult::U16(values) => Samples::U16(values),
        DecodingResult::F32(values) => Samples::F32(values),
        DecodingResult::U32(values) => to_f32(values, |v| v as f32),
        DecodingResult::U64(values) => to_f32(values, |v| v as f32),
        DecodingResult::F64(values) => to_f32(values, |v| v as f32),
        DecodingResult::I8(values) => to_f32(values, f32::from),
        DecodingResult::I16(values) => to_f32(values, f32::from),
        DecodingResult::I32(values) => to_f32(values, |v| v as f32),
        DecodingResult::I64(values) => to_f32(values, |v| v as f32),
    }
}

fn read_tiff(path: &Path) -> Result<(Vec<u64>, Samples), CiError> {
    let mut decoder = Decoder::new(BufReader::new(fs::File::open(path)?))?;
    let (width, height) = decoder.dimensions()?;
    let mut samples: Option<Samples> = None;
    let mut pages = 0u64;

    loop {
        if decoder.dimensions()? != (width, height) {
            return Err(CiError::Message(format!(
                "{}: pages have different dimensions",
                path.display()
            )));
        }
        let page = decode_page(decoder.read_image()?);
        match samples.as_mut() {
            Some(all) => all.append(page)?,
            None => samples = Some(page),
        }
        pages += 1;

        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    let samples = samples.ok_or_else(|| CiError::Message(format!("{}: no pages", path.display())))?;
    let plane = u64::from(width) * u64::from(height);
    let per_pixel = samples.len() as u64 / (plane * pages).max(1);

    let mut shape = Vec::with_capacity(4);
    if pages > 1 {
        shape.push(pages);
    }
    shape.extend([u64::from(height), u64::from(width)]);
    if per_pixel > 1 {
        shape.push(per_pixel);
    }

    Ok((shape, samples))
}

fn write_npy(path: &Path, shape: &[u64], samples: &Samples) -> Result<(), CiError> {
    let writer = BufWriter::new(fs::File::create(path)?);
    match samples {
        Samples::U8(data) => write_npy_values(writer, shape, data),
        Samples::U16(data) => write_npy_values(writer, shape, data),
        Samples::F32(data) => write_npy_values(writer, shape, data),
    }
}

fn write_npy_values<T, W>(writer: W, shape: &[u64], data: &[T]) -> Result<(), CiError>
where
    T: npyz::AutoSerialize,
    W: Write,
{
    let mut npy = npyz::WriteOptions::new()
        .default_dtype()
        .shape(shape)
        .writer(writer)
        .begin_nd()?;
    for value in data {
        npy.push(value)?;
    }
    npy.finish()?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(state) => state,
        Err(err) => err.into_inner(),
    }
}

pub struct NoProgressReporter;

impl NoProgressReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl VerifyReporter for NoProgressReporter {
    fn on_start(&self, _manifest: &Path, _entries: usize) {}

    fn on_check(&self, _outcome: &CheckOutcome) {}

    fn on_finish(&self, _stats: &VerifyStats) {}
}

impl GenerateReporter for NoProgressReporter {
    fn on_download(&self, _identifier: &str) {}

    fn on_downloaded(&self, _identifier: &str, _model_dir: &Path) {}

    fn on_converted(&self, _source: &Path, _target: &Path) {}

    fn on_skip(&self, _identifier: &str, _reason: &SkipReason) {}

    fn on_macro(&self, _line: &str) {}

    fn on_finish(&self, _stats: &GenerateStats) {}
}

impl ConvertReporter for NoProgressReporter {
    fn on_converted(&self, _source: &Path, _target: &Path) {}

    fn on_failed(&self, _source: &Path, _reason: &str) {}

    fn on_finish(&self, _stats: &ConvertStats) {}
}

pub struct IndicatifProgressReporter {
    bar: ProgressBar,
}

impl IndicatifProgressReporter {
    pub fn new() -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr())
    }

    pub fn with_draw_target(draw_target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(None, draw_target);
        let style = ProgressStyle::with_template("{spinner:.yellow} {msg:.blue}")
            .expect("invalid progress style template")
            .tick_chars("⣾⣽⣻⢿⡿⣟⣯⣷");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));

        Self { bar }
    }

    fn success(&self, message: String) {
        let _ = self.bar.println(style(message).green().to_string());
    }

    fn failure(&self, message: String) {
        let _ = self.bar.println(style(message).red().to_string());
    }

    fn finish(&self, message: String) {
        self.bar.disable_steady_tick();
        self.bar.finish_with_message(message);
    }
}

impl Default for IndicatifProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl VerifyReporter for IndicatifProgressReporter {
    fn on_start(&self, manifest: &Path, entries: usize) {
        self.bar
            .set_message(format!("checking {entries} files from {}", manifest.display()));
    }

    fn on_check(&self, outcome: &CheckOutcome) {
        if outcome.is_failure() {
            self.failure(outcome.to_string());
        } else {
            self.success(outcome.to_string());
        }
    }

    fn on_finish(&self, stats: &VerifyStats) {
        self.finish(format_verify_stats(stats));
    }
}

impl GenerateReporter for IndicatifProgressReporter {
    fn on_download(&self, identifier: &str) {
        self.bar
            .set_message(format!("Downloading the Bioimage.io model: {identifier}"));
    }

    fn on_downloaded(&self, identifier: &str, model_dir: &Path) {
        self.success(format!("downloaded {identifier}: {}", model_dir.display()));
    }

    fn on_converted(&self, source: &Path, target: &Path) {
        let _ = self
            .bar
            .println(format!("converted: {} -> {}", source.display(), target.display()));
    }

    fn on_skip(&self, identifier: &str, reason: &SkipReason) {
        let message = format!("skipped {identifier}: {reason}");
        let _ = self.bar.println(style(message).yellow().to_string());
    }

    fn on_macro(&self, line: &str) {
        let _ = self.bar.println(line);
    }

    fn on_finish(&self, stats: &GenerateStats) {
        self.finish(format_generate_stats(stats));
    }
}

impl ConvertReporter for IndicatifProgressReporter {
    fn on_converted(&self, source: &Path, target: &Path) {
        self.success(format!("converted: {} -> {}", source.display(), target.display()));
    }

    fn on_failed(&self, source: &Path, reason: &str) {
        self.failure(format!("failed: {} ({reason})", source.display()));
    }

    fn on_finish(&self, stats: &ConvertStats) {
        self.finish(format_convert_stats(stats));
    }
}

/// Plain one-line-per-event output for logs that are not a terminal.
pub struct LineProgressReporter<W: Write + Send> {
    writer: Mutex<W>,
}

impl LineProgressReporter<io::Stdout> {
    pub fn new() -> Self {
        Self::with_writer(io::stdout())
    }
}

impl Default for LineProgressReporter<io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> LineProgressReporter<W> {
    pub fn with_writer(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(err) => err.into_inner(),
        }
    }

    fn line(&self, message: &str) {
        let mut writer = lock(&self.writer);
        let _ = writeln!(writer, "{message}");
        let _ = writer.flush();
    }
}

impl<W: Write + Send> VerifyReporter for LineProgressReporter<W> {
    fn on_start(&self, _manifest: &Path, _entries: usize) {}

    fn on_check(&self, outcome: &CheckOutcome) {
        self.line(&outcome.to_string());
    }

    fn on_finish(&self, _stats: &VerifyStats) {}
}

impl<W: Write + Send> GenerateReporter for LineProgressReporter<W> {
    fn on_download(&self, identifier: &str) {
        self.line(&format!("Downloading the Bioimage.io model: {identifier}"));
    }

    fn on_downloaded(&self, identifier: &str, model_dir: &Path) {
        self.line(&format!("downloaded {identifier}: {}", model_dir.display()));
    }

    fn on_converted(&self, source: &Path, target: &Path) {
        self.line(&format!(
            "converted: {} -> {}",
            source.display(),
            target.display()
        ));
    }

    fn on_skip(&self, identifier: &str, reason: &SkipReason) {
        self.line(&format!("skipped {identifier}: {reason}"));
    }

    fn on_macro(&self, line: &str) {
        self.line(line);
    }

    fn on_finish(&self, stats: &GenerateStats) {
        self.line(&format_generate_stats(stats));
    }
}

impl<W: Write + Send> ConvertReporter for LineProgressReporter<W> {
    fn on_converted(&self, source: &Path, target: &Path) {
        self.line(&format!(
            "converted: {} -> {}",
            source.display(),
            target.display()
        ));
    }

    fn on_failed(&self, source: &Path, reason: &str) {
        self.line(&format!("failed: {} ({reason})", source.display()));
    }

    fn on_finish(&self, stats: &ConvertStats) {
        self.line(&format_convert_stats(stats));
    }
}

fn format_verify_stats(stats: &VerifyStats) -> String {
    format!("checked: {} failed: {}", stats.checked, stats.failed)
}

fn format_generate_stats(stats: &GenerateStats) -> String {
    format!(
        "models: {} macros: {} skipped: {} expected outputs: {}",
        stats.requested, stats.macros_written, stats.skipped, stats.expected_outputs
    )
}

fn format_convert_stats(stats: &ConvertStats) -> String {
    format!(
        "files: {} converted: {} failed: {}",
        stats.files_seen, stats.converted, stats.failed
    )
}
