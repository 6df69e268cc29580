use std::fs;
use std::process::Command;

fn rpress() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_rpress"));
    command.env("RUST_LOG", "warn").env_remove("RPRESS_LM_COMMAND");
    command
}

#[test]
fn init_then_check_config() {
    let temp_dir = tempfile::tempdir().expect("create temp dir");
    let config_path = temp_dir.path().join("rpress.json");

    let status = rpress()
        .arg("init")
        .arg("--config")
        .arg(&config_path)
        .status()
        .expect("run init");
    assert!(status.success());
    let text = fs::read_to_string(&config_path).expect("read config");
    assert!(text.contains("\"schema_version\": 1"));

    let again = rpress()
        .arg("init")
        .arg("--config")
        .arg(&config_path)
        .output()
        .expect("run init again");
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("--force"));

    let check = rpress()
        .arg("check")
        .arg("--config")
        .arg(&config_path)
        .output()
        .expect("run check");
    assert!(check.status.success());
    assert!(String::from_utf8_lossy(&check.stdout).contains(": ok"));
}

#[test]
fn check_rejects_zero_compile_passes() {
    let temp_dir = tempfile::tempdir().expect("create temp dir");
    let config_path = temp_dir.path().join("rpress.json");
    let print = rpress()
        .arg("init")
        .arg("--print")
        .output()
        .expect("run init --print");
    let stub = String::from_utf8(print.stdout).expect("utf8 stub");
    fs::write(
        &config_path,
        stub.replace("\"compile_passes\": 2", "\"compile_passes\": 0"),
    )
    .expect("write config");

    let check = rpress()
        .arg("check")
        .arg("--config")
        .arg(&config_path)
        .output()
        .expect("run check");
    assert!(!check.status.success());
    assert!(String::from_utf8_lossy(&check.stderr).contains("compile_passes"));
}

#[test]
fn check_fragment_reports_repair() {
    let temp_dir = tempfile::tempdir().expect("create temp dir");
    let fragment = temp_dir.path().join("kpis.tex");
    fs::write(&fragment, "\\begin{itemize}\n\\item Units up 12%\n").expect("write fragment");

    let output = rpress()
        .arg("check")
        .arg("--fragment")
        .arg(&fragment)
        .arg("--section")
        .arg("kpis")
        .output()
        .expect("run check");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("ok after repair"));

    fs::write(&fragment, "\\input{/etc/passwd}").expect("write fragment");
    let rejected = rpress()
        .arg("check")
        .arg("--fragment")
        .arg(&fragment)
        .output()
        .expect("run check");
    assert!(!rejected.status.success());
}

#[test]
fn run_fails_on_missing_summary() {
    let temp_dir = tempfile::tempdir().expect("create temp dir");
    let output = rpress()
        .arg("run")
        .arg("--summary")
        .arg(temp_dir.path().join("missing.txt"))
        .arg("--work-dir")
        .arg(temp_dir.path().join("work"))
        .output()
        .expect("run rpress");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("read dataset summary"));
}
