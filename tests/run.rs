//! Integration test for the `run` command on a generated model directory.
use rehub::cli::{RunOpts, handle_run_command};
use rehub::output::OutputFormat;
use std::fs::read_dir;
use tempfile::tempdir;


#[test]
fn test_handle_run_command() {
    unsafe { std::env::set_var("REHUB_LOG_LEVEL", "off") };

    let model = tempdir().unwrap();
    model_dir::write_model(model.path());
    let output = tempdir().unwrap();

    let opts = RunOpts {
        output_dir: Some(output.path().to_path_buf()),
        overwrite: true,
        format: OutputFormat::Csv,
    };
    handle_run_command(model.path(), &opts).unwrap();

    // Typical periods are cached for the next run
    assert!(output.path().join("clusters").is_dir());

    // The scenario produced at least the always-populated tables
    let files: Vec<String> = read_dir(output.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    for table in ["Performance", "Annuals", "Grid_t", "Time", "Buildings"] {
        let name = format!("results_base_1_{table}.csv");
        assert!(files.contains(&name), "missing {name}, got {files:?}");
    }

    // Running again with overwrite must not suffix new files
    handle_run_command(model.path(), &opts).unwrap();
    let count = read_dir(output.path()).unwrap().count();
    assert_eq!(count, files.len());
}
