pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod registry;

pub use crate::application::{
    convert_directory, convert_file, generate_macros, verify_outputs, CiError, ConvertDirection,
    ConvertReporter, FilePorts, GenerateReport, GenerateReporter, GenerateRequest,
    ModelRepository, VerifyReport, VerifyReporter,
};
pub use crate::domain::{
    format_macro_line, parse_model_identifiers, quote_macro_path, CheckOutcome, ConvertStats,
    ExpectedFile, GenerateStats, ModelDescriptor, Platform, SkipReason, VerifyStats,
    CONVERTED_SAMPLE_NAME, DEFAULT_COLLECTION_URL, RDF_FILE_NAME,
};
pub use crate::infrastructure::{
    FsPorts, IndicatifProgressReporter, LineProgressReporter, NoProgressReporter,
};
pub use crate::registry::BioimageioRepository;
