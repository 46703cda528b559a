use std::io::Cursor;
use std::path::Path;

use deepimagej_ci::{
    CheckOutcome, ConvertReporter, ConvertStats, GenerateReporter, GenerateStats,
    LineProgressReporter, SkipReason, VerifyReporter, VerifyStats,
};

#[test]
fn line_progress_reporter_prints_one_line_per_check() {
    let writer = Cursor::new(Vec::new());
    let reporter = LineProgressReporter::with_writer(writer);

    reporter.on_start(Path::new("expected.json"), 2);
    reporter.on_check(&CheckOutcome::Found {
        path: "out/a.tif".into(),
        actual: 42,
    });
    reporter.on_check(&CheckOutcome::Missing {
        path: "out/b.tif".into(),
    });
    VerifyReporter::on_finish(
        &reporter,
        &VerifyStats {
            checked: 2,
            failed: 1,
        },
    );

    let output = String::from_utf8(reporter.into_inner().into_inner()).unwrap();
    assert_eq!(
        output,
        "File 'out/a.tif' exists with size 42 bytes.\nError: Expected file 'out/b.tif' not found.\n"
    );
}

#[test]
fn line_progress_reporter_reports_generation_events() {
    let writer = Cursor::new(Vec::new());
    let reporter = LineProgressReporter::with_writer(writer);

    reporter.on_download("affable-shark");
    reporter.on_skip("affable-shark", &SkipReason::NoSampleInput);
    reporter.on_skip(
        "old-keras",
        &SkipReason::UnsupportedPlatform {
            formats: vec!["keras_hdf5".into()],
        },
    );
    GenerateReporter::on_finish(
        &reporter,
        &GenerateStats {
            requested: 2,
            skipped: 2,
            ..GenerateStats::default()
        },
    );

    let output = String::from_utf8(reporter.into_inner().into_inner()).unwrap();
    assert!(output.contains("Downloading the Bioimage.io model: affable-shark"));
    assert!(output.contains("skipped affable-shark: no sample input and no test input"));
    assert!(output.contains("skipped old-keras: no runtime for [keras_hdf5] on this platform"));
    assert!(output.contains("models: 2 macros: 0 skipped: 2"));
}

#[test]
fn line_progress_reporter_reports_failed_conversion() {
    let writer = Cursor::new(Vec::new());
    let reporter = LineProgressReporter::with_writer(writer);

    reporter.on_failed(Path::new("/tmp/bad.npy"), "invalid");
    ConvertReporter::on_finish(
        &reporter,
        &ConvertStats {
            files_seen: 1,
            converted: 0,
            failed: 1,
        },
    );

    let output = String::from_utf8(reporter.into_inner().into_inner()).unwrap();
    assert!(output.contains("failed: /tmp/bad.npy (invalid)"));
    assert!(output.contains("files: 1 converted: 0 failed: 1"));
}
