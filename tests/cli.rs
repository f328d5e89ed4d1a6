use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ragx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ragx");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("private")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(
        files_dir.join("private/secret.txt"),
        "Kubernetes credentials that must never be indexed.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/rag.sqlite"

[chunking]
max_chars = 400
overlap_chars = 40

[embedding]
provider = "hash"
dims = 128

[retrieval]
final_limit = 5

[policy]
allowed = ["{root}/files"]
excluded = ["{root}/files/private"]
"#,
        root = root.display()
    );

    let config_path = config_dir.join("rag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ragx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ragx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ragx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("files")
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ragx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_ragx(&config_path, &["init"]);
    assert!(success, "second init failed (not idempotent)");
}

#[test]
fn test_index_skips_excluded_and_unchanged() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    let files_arg = files.to_str().unwrap();

    let (stdout, stderr, success) =
        run_ragx(&config_path, &["index", files_arg, "--progress", "off"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("files: 3"), "stdout={}", stdout);
    assert!(stdout.contains("succeeded: 3"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_ragx(&config_path, &["index", files_arg, "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("skipped: 3"), "stdout={}", stdout);
}

#[test]
fn test_index_outside_policy_fails() {
    let (tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_ragx(
        &config_path,
        &["index", tmp.path().join("config").to_str().unwrap()],
    );
    assert!(!success);
    assert!(stderr.contains("access denied"), "stderr={}", stderr);
}

#[test]
fn test_search_hybrid_and_keyword() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    run_ragx(&config_path, &["index", files.to_str().unwrap(), "--progress", "off"]);

    let (stdout, stderr, success) = run_ragx(&config_path, &["search", "cargo crates"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.starts_with("1. ["), "stdout={}", stdout);
    assert!(stdout.lines().next().unwrap().contains("alpha.md"));

    let (stdout, _, success) =
        run_ragx(&config_path, &["search", "kubernetes", "--mode", "keyword"]);
    assert!(success);
    assert!(stdout.contains("gamma.txt"));
    assert!(!stdout.contains("secret.txt"));

    let (stdout, _, success) =
        run_ragx(&config_path, &["search", "zzzqqqxxx", "--mode", "keyword"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_json_output() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    run_ragx(&config_path, &["index", files.to_str().unwrap(), "--progress", "off"]);

    let (stdout, _, success) = run_ragx(
        &config_path,
        &["search", "python machine learning", "--json", "--type", "md"],
    );
    assert!(success);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let results = parsed.as_array().unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r["file_type"] == "markdown"));
    assert!(results[0]["file_path"]
        .as_str()
        .unwrap()
        .ends_with("beta.md"));
}

#[test]
fn test_invalid_query_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_ragx(&config_path, &["search", "x"]);
    assert!(!success);
    assert!(stderr.contains("invalid query"), "stderr={}", stderr);
}

#[test]
fn test_context_formats() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    run_ragx(&config_path, &["index", files.to_str().unwrap(), "--progress", "off"]);

    let (stdout, _, success) = run_ragx(&config_path, &["context", "deployment infrastructure"]);
    assert!(success);
    assert!(stdout.contains("Relevant context:"));
    assert!(stdout.contains("[1] "));

    let (stdout, _, success) = run_ragx(
        &config_path,
        &["context", "deployment infrastructure", "--format", "markdown"],
    );
    assert!(success);
    assert!(stdout.contains("# Search Results"));
}

#[test]
fn test_remove_and_stats() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    run_ragx(&config_path, &["index", files.to_str().unwrap(), "--progress", "off"]);

    let (stdout, _, success) = run_ragx(&config_path, &["stats", "--json"]);
    assert!(success);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["file_count"], 3);
    assert_eq!(stats["embedding_model_id"], "hash-128");

    let (stdout, _, success) = run_ragx(
        &config_path,
        &["remove", files.join("gamma.txt").to_str().unwrap()],
    );
    assert!(success);
    assert!(stdout.contains("removed 1 file(s)"));

    let (stdout, _, success) = run_ragx(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Files:       2"), "stdout={}", stdout);
}

#[test]
fn test_policy_set_persists() {
    let (tmp, config_path) = setup_test_env();
    let other = tmp.path().join("other");
    fs::create_dir_all(&other).unwrap();

    let (_, stderr, success) = run_ragx(
        &config_path,
        &["policy", "set", "--allow", other.to_str().unwrap()],
    );
    assert!(success, "policy set failed: {}", stderr);

    let (stdout, _, success) = run_ragx(&config_path, &["policy", "show"]);
    assert!(success);
    assert!(stdout.contains("other"));
    assert!(!stdout.contains("files"));
    assert!(stdout.contains("(none)"));
}

#[test]
fn test_health_reports_healthy_index() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    run_ragx(&config_path, &["index", files.to_str().unwrap(), "--progress", "off"]);

    let (stdout, stderr, success) = run_ragx(&config_path, &["health"]);
    assert!(success, "health failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(stdout.trim(), "healthy");

    let (stdout, _, success) = run_ragx(&config_path, &["health", "--json"]);
    assert!(success);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["healthy"], true);
    assert!(report["issues"].as_array().unwrap().is_empty());
}
