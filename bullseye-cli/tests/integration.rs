use std::process::Command;

fn bullseye() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_bullseye"));
    for var in [
        "BULLSEYE_CONFIG",
        "BULLSEYE_DATABASE",
        "BULLSEYE_WORKSPACE",
        "BULLSEYE_BIND",
        "BULLSEYE_API_KEY",
        "OLLAMA_API_URL",
        "OLLAMA_API_KEY",
        "RUST_LOG",
    ] {
        command.env_remove(var);
    }
    command
}

#[test]
fn help_lists_subcommands() {
    let output = bullseye().arg("--help").output().expect("failed to execute");

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    for subcommand in ["serve", "analyze", "models"] {
        assert!(stdout.contains(subcommand), "missing {subcommand} in help");
    }
}

#[test]
fn models_marks_the_default() {
    let output = bullseye().arg("models").output().expect("failed to execute");

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let default_line = stdout
        .lines()
        .find(|l| l.starts_with('*'))
        .expect("no default model marked");
    assert!(default_line.contains("deepseek-v3.2:cloud"));
    assert_eq!(stdout.lines().filter(|l| l.starts_with('*')).count(), 1);
}

#[test]
fn models_json_follows_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bullseye.toml");
    std::fs::write(
        &config,
        "default_model = \"local:7b\"\nmodels = [\"local:7b\", \"local:13b\"]\n",
    )
    .unwrap();

    let output = bullseye()
        .args(["--config", config.to_str().unwrap(), "models", "--json"])
        .output()
        .expect("failed to execute");

    assert!(output.status.success());
    let body: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["default"], "local:7b");
    assert_eq!(body["models"], serde_json::json!(["local:7b", "local:13b"]));
}

#[test]
fn invalid_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bullseye.toml");
    std::fs::write(&config, "scanner_concurrency = 0\n").unwrap();

    let output = bullseye()
        .args(["--config", config.to_str().unwrap(), "models"])
        .output()
        .expect("failed to execute");

    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("scanner_concurrency"), "{stderr}");
}

#[test]
fn analyze_rejects_a_malformed_locator() {
    let dir = tempfile::tempdir().unwrap();
    let output = bullseye()
        .args([
            "--database",
            dir.path().join("db.sqlite").to_str().unwrap(),
            "--workspace",
            dir.path().join("repos").to_str().unwrap(),
            "analyze",
            "not a url",
        ])
        .output()
        .expect("failed to execute");

    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("invalid request"), "{stderr}");
}

#[test]
fn analyze_accepts_a_local_directory() {
    let dir = tempfile::tempdir().unwrap();
    let checkout = dir.path().join("widgets");
    std::fs::create_dir(&checkout).unwrap();

    let output = bullseye()
        .args([
            "--database",
            dir.path().join("db.sqlite").to_str().unwrap(),
            "--workspace",
            dir.path().join("repos").to_str().unwrap(),
            "analyze",
            checkout.to_str().unwrap(),
        ])
        .output()
        .expect("failed to execute");

    // Not a git checkout, so the clone fails, but the path was accepted.
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("submitted"), "{stderr}");
    assert!(!stderr.contains("invalid request"), "{stderr}");
}
