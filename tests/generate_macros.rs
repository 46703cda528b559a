use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use deepimagej_ci::{
    generate_macros, CiError, ExpectedFile, FsPorts, GenerateRequest, ModelRepository,
    NoProgressReporter, Platform, CONVERTED_SAMPLE_NAME, RDF_FILE_NAME,
};
use npyz::WriterBuilder;

struct FakeModel {
    folder: String,
    rdf: String,
    files: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
struct FakeRepository {
    models: HashMap<String, FakeModel>,
    downloads: Mutex<Vec<String>>,
}

impl FakeRepository {
    fn with_model(mut self, id: &str, folder: &str, rdf: &str, files: Vec<(&str, Vec<u8>)>) -> Self {
        self.models.insert(
            id.to_owned(),
            FakeModel {
                folder: folder.to_owned(),
                rdf: rdf.to_owned(),
                files: files
                    .into_iter()
                    .map(|(name, bytes)| (name.to_owned(), bytes))
                    .collect(),
            },
        );
        self
    }

    fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

impl ModelRepository for FakeRepository {
    fn download(&self, identifier: &str, models_dir: &Path) -> Result<PathBuf, CiError> {
        self.downloads.lock().unwrap().push(identifier.to_owned());
        let model = self
            .models
            .get(identifier)
            .ok_or_else(|| CiError::ModelNotFound(identifier.to_owned()))?;

        let model_dir = models_dir.join(&model.folder);
        fs::create_dir_all(&model_dir)?;
        fs::write(model_dir.join(RDF_FILE_NAME), &model.rdf)?;
        for (name, bytes) in &model.files {
            fs::write(model_dir.join(name), bytes)?;
        }
        Ok(model_dir)
    }
}

fn rdf(outputs: &[&str], sample: Option<&str>, test: Option<&str>, weights: &str) -> String {
    let mut text = String::from("format_version: 0.4.10\nname: fake\ninputs:\n  - name: input0\n    axes: bcyx\noutputs:\n");
    for output in outputs {
        text.push_str(&format!("  - name: {output}\n    axes: bcyx\n"));
    }
    if let Some(sample) = sample {
        text.push_str(&format!("sample_inputs: [{sample}]\n"));
    }
    if let Some(test) = test {
        text.push_str(&format!("test_inputs: [{test}]\n"));
    }
    text.push_str(&format!("weights:\n  {weights}:\n    source: weights.bin\n"));
    text
}

fn npy_bytes(shape: &[u64], values: &[f32]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut bytes = Vec::new();
    let mut writer = npyz::WriteOptions::new()
        .default_dtype()
        .shape(shape)
        .writer(&mut bytes)
        .begin_nd()?;
    for value in values {
        writer.push(value)?;
    }
    writer.finish()?;
    Ok(bytes)
}

fn request(root: &Path, identifiers: &[&str]) -> GenerateRequest {
    GenerateRequest {
        identifiers: identifiers.iter().map(|id| id.to_string()).collect(),
        models_dir: root.join("models"),
        macro_path: root.join("macro.ijm"),
        manifest_path: root.join("expected.json"),
        platform: Platform::new("linux", "x86_64"),
    }
}

fn read_manifest(path: &Path) -> Result<Vec<ExpectedFile>, Box<dyn std::error::Error>> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

#[test]
fn writes_one_line_per_model_and_one_entry_per_output() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let repository = FakeRepository::default()
        .with_model(
            "m1",
            "m1",
            &rdf(&["output0"], Some("sample_input_0.tif"), None, "torchscript"),
            vec![("sample_input_0.tif", b"tif".to_vec())],
        )
        .with_model(
            "m2",
            "m2",
            &rdf(&["mask", "boundaries"], Some("sample.png"), None, "onnx"),
            vec![("sample.png", b"png".to_vec())],
        );
    let request = request(temp_dir.path(), &["m1", "m2"]);

    let report = generate_macros(&repository, &FsPorts::new(), &NoProgressReporter::new(), &request)?;

    let macro_text = fs::read_to_string(&request.macro_path)?;
    let lines: Vec<&str> = macro_text.lines().collect();
    assert_eq!(lines.len(), 2);

    let m1 = request.models_dir.join("m1");
    assert_eq!(
        lines[0],
        format!(
            "run(\"DeepImageJ Run\", \"modelPath={dir} inputPath={dir}/sample_input_0.tif outputFolder={dir} displayOutput=null\")",
            dir = m1.display()
        )
    );

    let manifest = read_manifest(&request.manifest_path)?;
    assert_eq!(manifest, report.expected);
    assert_eq!(manifest.len(), 3);
    assert!(manifest.iter().all(|entry| entry.min_size == 1));
    assert_eq!(
        manifest[0].path,
        m1.join("sample_input_0_output0.tif").display().to_string()
    );
    assert_eq!(
        manifest[2].path,
        request.models_dir.join("m2").join("sample_boundaries.tif").display().to_string()
    );
    assert_eq!(repository.downloads(), vec!["m1", "m2"]);

    Ok(())
}

#[test]
fn skips_model_without_sample_or_test_input() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let repository = FakeRepository::default()
        .with_model("bare", "bare", &rdf(&["output0"], None, None, "torchscript"), vec![])
        .with_model(
            "ok",
            "ok",
            &rdf(&["output0"], Some("in.tif"), None, "torchscript"),
            vec![("in.tif", b"tif".to_vec())],
        );
    let request = request(temp_dir.path(), &["bare", "ok"]);

    let report = generate_macros(&repository, &FsPorts::new(), &NoProgressReporter::new(), &request)?;

    assert_eq!(fs::read_to_string(&request.macro_path)?.lines().count(), 1);
    assert_eq!(report.expected.len(), 1);
    assert_eq!(report.stats.skipped, 1);
    assert!(report.expected[0].path.contains("ok"));

    Ok(())
}

#[test]
fn declared_sample_missing_on_disk_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let repository = FakeRepository::default().with_model(
        "m",
        "m",
        &rdf(&["output0"], Some("sample_input_0.tif"), Some("test_input_0.npy"), "onnx"),
        vec![],
    );
    let request = request(temp_dir.path(), &["m"]);

    let report = generate_macros(&repository, &FsPorts::new(), &NoProgressReporter::new(), &request)?;

    assert_eq!(report.stats.macros_written, 0);
    assert!(report.expected.is_empty());
    assert_eq!(read_manifest(&request.manifest_path)?, Vec::new());

    Ok(())
}

#[test]
fn converts_test_array_when_no_sample_exists() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let values: Vec<f32> = (0..16).map(|v| v as f32 / 2.0).collect();
    let repository = FakeRepository::default().with_model(
        "m",
        "m",
        &rdf(&["output0"], None, Some("test_input_0.npy"), "torchscript"),
        vec![("test_input_0.npy", npy_bytes(&[1, 1, 4, 4], &values)?)],
    );
    let request = request(temp_dir.path(), &["m"]);

    let report = generate_macros(&repository, &FsPorts::new(), &NoProgressReporter::new(), &request)?;

    let model_dir = request.models_dir.join("m");
    let converted = model_dir.join(CONVERTED_SAMPLE_NAME);
    assert!(fs::metadata(&converted)?.len() > 0);
    assert_eq!(report.stats.converted, 1);
    assert!(fs::read_to_string(&request.macro_path)?
        .contains(&format!("inputPath={}", converted.display())));
    assert_eq!(
        report.expected,
        vec![ExpectedFile::new(
            model_dir.join("sample_input_0_output0.tif").display().to_string()
        )]
    );

    Ok(())
}

#[test]
fn brackets_paths_with_spaces() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let repository = FakeRepository::default().with_model(
        "spaced",
        "StarDist H_E Nuclei",
        &rdf(&["output0"], Some("sample_input_0.tif"), None, "tensorflow_saved_model_bundle"),
        vec![("sample_input_0.tif", b"tif".to_vec())],
    );
    let request = request(temp_dir.path(), &["spaced"]);

    generate_macros(&repository, &FsPorts::new(), &NoProgressReporter::new(), &request)?;

    let model_dir = request.models_dir.join("StarDist H_E Nuclei");
    let line = fs::read_to_string(&request.macro_path)?;
    assert!(line.contains(&format!("modelPath=[{}]", model_dir.display())));
    assert!(line.contains(&format!(
        "inputPath=[{}]",
        model_dir.join("sample_input_0.tif").display()
    )));
    assert!(line.contains(&format!("outputFolder=[{}]", model_dir.display())));

    Ok(())
}

#[test]
fn skips_models_without_runtime_for_platform() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let repository = FakeRepository::default().with_model(
        "keras",
        "keras",
        &rdf(&["output0"], Some("in.tif"), None, "keras_hdf5"),
        vec![("in.tif", b"tif".to_vec())],
    );
    let request = request(temp_dir.path(), &["keras"]);

    let report = generate_macros(&repository, &FsPorts::new(), &NoProgressReporter::new(), &request)?;

    assert_eq!(report.stats.downloaded, 1);
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(fs::read_to_string(&request.macro_path)?, "");

    Ok(())
}

#[test]
fn download_failure_aborts_the_run() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let repository = FakeRepository::default().with_model(
        "later",
        "later",
        &rdf(&["output0"], Some("in.tif"), None, "onnx"),
        vec![("in.tif", b"tif".to_vec())],
    );
    let request = request(temp_dir.path(), &["missing", "later"]);

    let result = generate_macros(&repository, &FsPorts::new(), &NoProgressReporter::new(), &request);

    assert!(matches!(result, Err(CiError::ModelNotFound(id)) if id == "missing"));
    assert_eq!(repository.downloads(), vec!["missing"]);
    assert!(!request.manifest_path.exists());

    Ok(())
}

#[test]
fn appends_to_existing_macro_file() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let repository = FakeRepository::default().with_model(
        "m",
        "m",
        &rdf(&["output0"], Some("in.tif"), None, "onnx"),
        vec![("in.tif", b"tif".to_vec())],
    );
    let request = request(temp_dir.path(), &["m"]);
    fs::write(&request.macro_path, "print(\"previous\");\n")?;

    generate_macros(&repository, &FsPorts::new(), &NoProgressReporter::new(), &request)?;

    let macro_text = fs::read_to_string(&request.macro_path)?;
    let lines: Vec<&str> = macro_text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "print(\"previous\");");
    assert!(lines[1].starts_with("run(\"DeepImageJ Run\""));

    Ok(())
}
