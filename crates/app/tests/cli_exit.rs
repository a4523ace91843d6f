use std::process::{Command, Output};

use tempfile::tempdir;

fn run_vidsr(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vidsr"))
        .args(args)
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1")
        .output()
        .expect("run vidsr")
}

#[test]
fn invalid_config_exits_1_and_reports_once() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "[inference]\nscale = 0\n").expect("write config");

    let output = run_vidsr(&[
        "--data-dir",
        dir.path().to_str().expect("utf-8 path"),
        "--config",
        config.to_str().expect("utf-8 path"),
    ]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        stderr.matches("invalid configuration").count(),
        1,
        "stderr:\n{stderr}"
    );
}

#[test]
fn missing_model_exits_1_before_looking_for_inputs() {
    let dir = tempdir().expect("tempdir");
    let input_dir = dir.path().join("in");
    std::fs::create_dir_all(&input_dir).expect("create input dir");
    let model = dir.path().join("absent.onnx");

    let output = run_vidsr(&[
        "--data-dir",
        dir.path().to_str().expect("utf-8 path"),
        "--config",
        dir.path().join("config.toml").to_str().expect("utf-8 path"),
        "-i",
        input_dir.to_str().expect("utf-8 path"),
        "-o",
        dir.path().join("out").to_str().expect("utf-8 path"),
        "-m",
        model.to_str().expect("utf-8 path"),
        "--device",
        "cpu",
    ]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("absent.onnx"), "stderr:\n{stderr}");
    assert!(!dir.path().join("out").exists());
}
