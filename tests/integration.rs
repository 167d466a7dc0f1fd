use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn mdispatch_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("mdispatch");
    path
}

fn write_config(root: &Path, body: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let path = config_dir.join("dispatch.toml");
    fs::write(&path, body).unwrap();
    path
}

fn run_mdispatch(config: &Path, args: &[&str]) -> std::process::Output {
    Command::new(mdispatch_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to execute mdispatch")
}

#[test]
fn test_tasks_lists_builtin_table() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("missing.toml");

    let output = run_mdispatch(&config, &["tasks"]);
    assert!(output.status.success(), "tasks failed: {:?}", output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    let aes = stdout
        .lines()
        .find(|l| l.starts_with("aes_out "))
        .expect("aes_out listed");
    assert!(aes.contains("6008"));
    assert!(aes.contains("mlb (ext)"));

    let stats = stdout
        .lines()
        .find(|l| l.starts_with("image_stats "))
        .expect("image_stats listed");
    assert!(stats.contains("6020"));
    assert!(!stats.contains("(ext)"));
}

#[test]
fn test_tasks_applies_config_overrides() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(
        tmp.path(),
        r#"
[tasks.image_stats]
port = 7020

[tasks.thumb_hist]
port = 7100
processor = "byte_histogram"
vectors = true
"#,
    );

    let output = run_mdispatch(&config, &["tasks"]);
    assert!(output.status.success(), "tasks failed: {:?}", output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.lines().any(|l| l.starts_with("image_stats ") && l.contains("7020")));
    let custom = stdout
        .lines()
        .find(|l| l.starts_with("thumb_hist "))
        .expect("new task listed");
    assert!(custom.contains("7100"));
    assert!(custom.trim_end().ends_with("yes"));
}

#[test]
fn test_unknown_task_fails_with_valid_ids() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("missing.toml");

    let output = run_mdispatch(&config, &["start_server", "no_such_task"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown task 'no_such_task'"), "stderr: {}", stderr);
    assert!(stderr.contains("aes_out"));
    assert!(stderr.contains("image_stats"));
}

#[test]
fn test_client_for_external_processor_fails() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("missing.toml");

    let output = run_mdispatch(&config, &["start_client", "aes_out"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("processor 'mlb'"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), "[dispatch]\nbatch_size = 0\n");

    let output = run_mdispatch(&config, &["tasks"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("batch_size"), "stderr: {}", stderr);
}
