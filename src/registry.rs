use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use reqwest::blocking::Client;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::application::{CiError, ModelRepository};
use crate::domain::{
    ModelDescriptor, RDF_FILE_NAME, is_remote_source, local_file_name, sanitize_folder_name,
};

const DOWNLOAD_ARCHIVE_NAME: &str = "model_download.zip";

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub rdf_source: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl CollectionEntry {
    fn matches(&self, identifier: &str) -> bool {
        let is_model = self.kind.as_deref().is_none_or(|kind| kind == "model");
        is_model
            && (self.id == identifier
                || self.nickname.as_deref() == Some(identifier)
                || self.name.as_deref() == Some(identifier))
    }

    pub fn folder_name(&self) -> String {
        sanitize_folder_name(self.name.as_deref().unwrap_or(&self.id))
    }
}

#[derive(Debug, Deserialize)]
struct CollectionIndex {
    #[serde(alias = "entries")]
    collection: Vec<CollectionEntry>,
}

pub fn parse_collection(json: &str) -> Result<Vec<CollectionEntry>, CiError> {
    let index: CollectionIndex = serde_json::from_str(json)?;
    Ok(index.collection)
}

/// Resolves a file referenced by an rdf against the rdf's own URL.
pub fn resolve_source_url(rdf_source: &str, source: &str) -> String {
    if is_remote_source(source) {
        return source.to_owned();
    }
    let relative = source.trim_start_matches("./");

    // `.../files/rdf.yaml/content` has siblings at `.../files/<name>/content`
    if let Some(rdf_file) = rdf_source.strip_suffix("/content") {
        if let Some(index) = rdf_file.rfind('/') {
            return format!("{}{relative}/content", &rdf_file[..=index]);
        }
    }

    let base = match rdf_source.rfind('/') {
        Some(index) => &rdf_source[..=index],
        None => "",
    };
    format!("{base}{relative}")
}

/// Joins a relative path below `root`, refusing anything that would escape it.
fn contained_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
    {
        Some(root.join(relative))
    } else {
        None
    }
}

/// Client for the bioimage.io model collection.
pub struct BioimageioRepository {
    client: Client,
    entries: Vec<CollectionEntry>,
}

impl BioimageioRepository {
    pub fn connect(collection_url: &str) -> Result<Self, CiError> {
        let client = Client::builder()
            .user_agent(concat!("deepimagej-ci/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let json = client
            .get(collection_url)
            .send()?
            .error_for_status()?
            .text()?;
        let entries = parse_collection(&json)?;
        Ok(Self { client, entries })
    }

    pub fn with_entries(client: Client, entries: Vec<CollectionEntry>) -> Self {
        Self { client, entries }
    }

    pub fn find(&self, identifier: &str) -> Option<&CollectionEntry> {
        self.entries.iter().find(|entry| entry.matches(identifier))
    }

    fn fetch_to_file(&self, url: &str, target: &Path) -> Result<u64, CiError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut response = self.client.get(url).send()?.error_for_status()?;
        let mut file = fs::File::create(target)?;
        Ok(response.copy_to(&mut file)?)
    }

    fn download_archive(&self, url: &str, model_dir: &Path) -> Result<PathBuf, CiError> {
        let archive_path = model_dir.join(DOWNLOAD_ARCHIVE_NAME);
        self.fetch_to_file(url, &archive_path)?;
        extract_archive(&archive_path, model_dir)?;
        fs::remove_file(&archive_path)?;
        find_rdf_dir(model_dir)
    }

    fn download_files(&self, rdf_source: &str, model_dir: &Path) -> Result<PathBuf, CiError> {
        let rdf_text = self
            .client
            .get(rdf_source)
            .send()?
            .error_for_status()?
            .text()?;
        let descriptor = ModelDescriptor::from_yaml(&rdf_text)?;
        fs::write(model_dir.join(RDF_FILE_NAME), &rdf_text)?;

        for source in descriptor.referenced_files() {
            let Some(target) = contained_path(model_dir, local_file_name(&source)) else {
                return Err(CiError::Message(format!(
                    "refusing to write outside the model folder: {source}"
                )));
            };
            self.fetch_to_file(&resolve_source_url(rdf_source, &source), &target)?;
        }

        Ok(model_dir.to_path_buf())
    }
}

impl ModelRepository for BioimageioRepository {
    fn download(&self, identifier: &str, models_dir: &Path) -> Result<PathBuf, CiError> {
        let entry = self
            .find(identifier)
            .ok_or_else(|| CiError::ModelNotFound(identifier.to_owned()))?;
        let model_dir = models_dir.join(entry.folder_name());
        fs::create_dir_all(&model_dir)?;

        match (&entry.download_url, &entry.rdf_source) {
            (Some(url), _) if url.ends_with(".zip") => self.download_archive(url, &model_dir),
            (_, Some(rdf_source)) => self.download_files(rdf_source, &model_dir),
            _ => Err(CiError::Message(format!(
                "collection entry {} has neither a zip nor an rdf source",
                entry.id
            ))),
        }
    }
}

pub fn extract_archive(archive_path: &Path, output_dir: &Path) -> Result<(), CiError> {
    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        let output_path = output_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&output_path)?;
            continue;
        }
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output_file = fs::File::create(&output_path)?;
        io::copy(&mut entry, &mut output_file)?;
    }

    Ok(())
}

/// Packages may nest everything under one top-level folder.
pub fn find_rdf_dir(model_dir: &Path) -> Result<PathBuf, CiError> {
    if model_dir.join(RDF_FILE_NAME).is_file() {
        return Ok(model_dir.to_path_buf());
    }

    for entry in WalkDir::new(model_dir).min_depth(1).max_depth(3) {
        let entry = entry.map_err(|err| CiError::Message(err.to_string()))?;
        if entry.file_type().is_file() && entry.file_name() == RDF_FILE_NAME {
            if let Some(parent) = entry.path().parent() {
                return Ok(parent.to_path_buf());
            }
        }
    }

    Err(CiError::Message(format!(
        "no {RDF_FILE_NAME} in {}",
        model_dir.display()
    )))
}
