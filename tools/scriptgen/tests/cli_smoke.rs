use assert_cmd::cargo::cargo_bin_cmd;

#[test]
fn help_lists_proxy_flags() {
    let mut cmd = cargo_bin_cmd!("scriptgen");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    for flag in [
        "--config",
        "--working-dir",
        "--browser",
        "--output-dir",
        "--log-file",
        "--action-log",
        "--no-eager-start",
    ] {
        assert!(stdout.contains(flag), "missing {flag} in help");
    }
}

#[test]
fn version_prints_and_exits_zero() {
    let mut cmd = cargo_bin_cmd!("scriptgen");
    cmd.arg("--version");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.starts_with("scriptgen "));
}

#[test]
fn unknown_flag_exits_nonzero() {
    let mut cmd = cargo_bin_cmd!("scriptgen");
    cmd.arg("--headless");
    cmd.assert().failure().code(1);
}

#[test]
fn missing_config_file_exits_nonzero_with_a_message() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("scriptgen");
    cmd.arg("--config").arg(temp.path().join("missing.toml"));
    let out = cmd.assert().failure().code(1);
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("io error"));
}

#[test]
fn invalid_config_is_rejected_before_anything_starts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("scriptgen.toml");
    std::fs::write(&config, "[service]\nstartup_timeout_ms = 0\n").expect("write config");

    let mut cmd = cargo_bin_cmd!("scriptgen");
    cmd.arg("--config").arg(&config).current_dir(temp.path());
    let out = cmd.assert().failure().code(1);
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("invalid config"));
    assert!(!temp.path().join(".scriptgen").exists());
}
