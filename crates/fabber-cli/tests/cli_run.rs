//! End-to-end runs through the CLI entry point.

use std::fs::File;
use std::path::Path;

use ndarray::Array4;
use ndarray_npy::WriteNpyExt;

fn write_constant_volume(path: &Path, value: f64) {
    let mut vol = Array4::<f64>::zeros((2, 1, 1, 10));
    for x in 0..2 {
        for t in 0..10 {
            vol[[x, 0, 0, t]] = value;
        }
    }
    vol.write_npy(File::create(path).unwrap()).unwrap();
}

fn args(pairs: &[(&str, &str)]) -> Vec<String> {
    pairs
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                format!("--{k}")
            } else {
                format!("--{k}={v}")
            }
        })
        .collect()
}

#[test]
fn test_full_run_writes_outputs_and_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("data.npy");
    write_constant_volume(&data_path, 1.0);
    let out = dir.path().join("out");

    let code = fabber_cli::run_app(&args(&[
        ("model", "trivial"),
        ("method", "vb"),
        ("data", data_path.to_str().unwrap()),
        ("output", out.to_str().unwrap()),
    ]))
    .unwrap();

    assert_eq!(code, 0);
    assert!(out.join("mean_value.npy").exists());
    assert!(out.join("finalMVN.npy").exists());
    assert!(out.join("paramnames.txt").exists());
    assert!(out.join("logfile.txt").exists());
    let names = std::fs::read_to_string(out.join("paramnames.txt")).unwrap();
    assert_eq!(names.trim(), "value");
}

#[test]
fn test_output_directory_gains_plus_suffixes_on_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("data.npy");
    write_constant_volume(&data_path, 2.0);
    let out = dir.path().join("results");

    let run_args = args(&[
        ("model", "trivial"),
        ("method", "vb"),
        ("data", data_path.to_str().unwrap()),
        ("output", out.to_str().unwrap()),
    ]);

    assert_eq!(fabber_cli::run_app(&run_args).unwrap(), 0);
    assert_eq!(fabber_cli::run_app(&run_args).unwrap(), 0);
    assert_eq!(fabber_cli::run_app(&run_args).unwrap(), 0);

    assert!(out.join("mean_value.npy").exists());
    let plus = dir.path().join("results+");
    let plus_plus = dir.path().join("results++");
    assert!(plus.join("mean_value.npy").exists());
    assert!(plus_plus.join("mean_value.npy").exists());
}

#[test]
fn test_overwrite_reuses_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("data.npy");
    write_constant_volume(&data_path, 2.0);
    let out = dir.path().join("results");

    let run_args = args(&[
        ("model", "trivial"),
        ("method", "vb"),
        ("data", data_path.to_str().unwrap()),
        ("output", out.to_str().unwrap()),
        ("overwrite", ""),
    ]);

    assert_eq!(fabber_cli::run_app(&run_args).unwrap(), 0);
    assert_eq!(fabber_cli::run_app(&run_args).unwrap(), 0);
    assert!(!dir.path().join("results+").exists());
}

#[test]
fn test_missing_data_file_fails_before_any_output() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");

    let err = fabber_cli::run_app(&args(&[
        ("model", "trivial"),
        ("method", "vb"),
        ("data", "/nonexistent/data.npy"),
        ("output", out.to_str().unwrap()),
    ]))
    .unwrap_err();

    assert!(err.to_string().contains("not found"));
    assert!(!out.join("mean_value.npy").exists());
}

#[test]
fn test_unknown_model_is_an_invalid_option() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("data.npy");
    write_constant_volume(&data_path, 1.0);
    let out = dir.path().join("out");

    let err = fabber_cli::run_app(&args(&[
        ("model", "nonesuch"),
        ("method", "vb"),
        ("data", data_path.to_str().unwrap()),
        ("output", out.to_str().unwrap()),
    ]))
    .unwrap_err();
    assert!(err.to_string().contains("unknown model"));
}

#[test]
fn test_list_and_help_commands() {
    assert_eq!(fabber_cli::run_app(&["--listmodels".into()]).unwrap(), 0);
    assert_eq!(fabber_cli::run_app(&["--listmethods".into()]).unwrap(), 0);
    assert_eq!(fabber_cli::run_app(&["--help".into()]).unwrap(), 0);
    assert_eq!(
        fabber_cli::run_app(&["--help".into(), "--model=poly".into()]).unwrap(),
        0
    );
    assert_eq!(
        fabber_cli::run_app(&["--help".into(), "--method=spatialvb".into()]).unwrap(),
        0
    );
}

#[test]
fn test_loadmodels_is_rejected() {
    let err = fabber_cli::run_app(&["--loadmodels=libfoo.so".into()]).unwrap_err();
    assert!(err.to_string().contains("not available"));
}

#[test]
fn test_options_from_parameter_file() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("data.npy");
    write_constant_volume(&data_path, 1.0);
    let out = dir.path().join("out");

    let opts_path = dir.path().join("fabber_opts.txt");
    std::fs::write(
        &opts_path,
        format!(
            "# fabber options\n--model=trivial\n--method=vb\n--data={}\n--output={}\n",
            data_path.display(),
            out.display()
        ),
    )
    .unwrap();

    let code =
        fabber_cli::run_app(&["-f".to_string(), opts_path.to_str().unwrap().to_string()])
            .unwrap();
    assert_eq!(code, 0);
    assert!(out.join("mean_value.npy").exists());
}
