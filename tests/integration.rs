use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn facts_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("facts");
    path
}

/// Build a corpus table from `(id, text, topic_id)` rows.
fn write_corpus(db_path: &Path, rows: &[(i64, &str, i64)]) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let mut conn = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .connect()
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE messages (id INTEGER PRIMARY KEY, text TEXT, date TEXT, topic_id INTEGER)",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        for (id, text, topic) in rows {
            sqlx::query("INSERT INTO messages (id, text, date, topic_id) VALUES (?, ?, '2024-05-01', ?)")
                .bind(id)
                .bind(text)
                .bind(topic)
                .execute(&mut conn)
                .await
                .unwrap();
        }
        conn.close().await.unwrap();
    });
}

fn setup_test_env(rows: &[(i64, &str, i64)]) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    write_corpus(&root.join("corpus.db"), rows);

    let config_content = format!(
        r#"[corpus]
path = "{root}/corpus.db"
table = "messages"

[batching]
context_budget = 180000
per_item_overhead = 400

[generation]
backend = "stub"

[output]
output_dir = "{root}/out"
state_dir = "{root}/state"
"#,
        root = root.display()
    );

    let config_path = root.join("facts.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_facts(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = facts_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run facts binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn summary(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout).unwrap_or_else(|e| panic!("bad summary {:?}: {}", stdout, e))
}

fn knowledge_lines(root: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(root.join("out/knowledge.jsonl"))
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

const REVENUE: &str = "Revenue grew 12% in Q2. Lots of filler text follows.";

#[test]
fn test_stub_run_extracts_first_sentence() {
    let (tmp, config_path) = setup_test_env(&[(5, REVENUE, 1)]);

    let (stdout, stderr, success) = run_facts(&config_path, &["run"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);

    let s = summary(&stdout);
    assert_eq!(s["batches"], 1);
    assert_eq!(s["accepted_facts"], 1);
    assert_eq!(s["errors"], 0);
    assert_eq!(s["last_id"], 5);

    let facts = knowledge_lines(tmp.path());
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0]["statement"], "Revenue grew 12% in Q2");
    assert_eq!(facts[0]["sources"][0]["source_id"], "msg:5");
    assert_eq!(facts[0]["meta"]["source_ids_csv"], "5");
    assert_eq!(facts[0]["meta"]["date_min"], "2024-05-01");
    assert_eq!(facts[0]["meta"]["topic_id"], 1);
    assert_eq!(facts[0]["hash"].as_str().unwrap().len(), 64);

    let summaries: Vec<_> = fs::read_dir(tmp.path().join("out"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("summary_"))
        .collect();
    assert_eq!(summaries.len(), 1);
    assert!(fs::read_dir(tmp.path().join("out/raw")).unwrap().count() >= 1);
}

#[test]
fn test_resumed_run_reads_nothing_new() {
    let (tmp, config_path) = setup_test_env(&[(1, "Alpha shipped. x", 1), (2, "Beta shipped. y", 1)]);

    let (stdout, _, success) = run_facts(&config_path, &["run"]);
    assert!(success);
    assert_eq!(summary(&stdout)["accepted_facts"], 2);

    let (stdout, stderr, success) = run_facts(&config_path, &["run"]);
    assert!(success, "second run failed: {}", stderr);
    let s = summary(&stdout);
    assert_eq!(s["batches"], 0);
    assert_eq!(s["accepted_facts"], 0);
    assert_eq!(s["errors"], 0);
    assert_eq!(s["last_id"], 2);
    assert_eq!(knowledge_lines(tmp.path()).len(), 2);
}

#[test]
fn test_no_resume_restarts_but_keeps_log() {
    let (tmp, config_path) = setup_test_env(&[(1, "Alpha shipped. x", 1)]);

    run_facts(&config_path, &["run"]);
    let (stdout, _, success) = run_facts(&config_path, &["run", "--no-resume"]);
    assert!(success);
    let s = summary(&stdout);
    assert_eq!(s["batches"], 1);
    assert_eq!(s["accepted_facts"], 1);

    // The log is never truncated, so the fact now appears twice.
    assert_eq!(knowledge_lines(tmp.path()).len(), 2);
}

#[test]
fn test_limit_and_topic_filter() {
    let (_tmp, config_path) = setup_test_env(&[
        (1, "One. a", 1),
        (2, "Two. b", 2),
        (3, "Three. c", 1),
        (4, "Four. d", 1),
    ]);

    let (stdout, _, success) = run_facts(&config_path, &["count", "--topic-id", "1"]);
    assert!(success);
    assert_eq!(stdout.trim(), "3");

    let (stdout, _, success) =
        run_facts(&config_path, &["run", "--topic-id", "1", "--limit", "2"]);
    assert!(success);
    let s = summary(&stdout);
    assert_eq!(s["accepted_facts"], 2);
    assert_eq!(s["last_id"], 3);

    let (stdout, _, _) = run_facts(&config_path, &["count", "--topic-id", "1"]);
    assert_eq!(stdout.trim(), "1");
}

#[test]
fn test_small_budget_splits_batches() {
    let (tmp, config_path) = setup_test_env(&[(1, "One. a", 1), (2, "Two. b", 1), (3, "Three. c", 1)]);

    let (stdout, stderr, success) = run_facts(
        &config_path,
        &["run", "--budget", "10", "--overhead", "5"],
    );
    assert!(success, "run failed: {}", stderr);
    let s = summary(&stdout);
    assert_eq!(s["batches"], 3);
    assert_eq!(s["last_id"], 3);
    assert_eq!(fs::read_dir(tmp.path().join("out/raw")).unwrap().count(), 3);
}

#[test]
fn test_status_reports_checkpoint() {
    let (_tmp, config_path) = setup_test_env(&[(7, REVENUE, 1)]);

    let (stdout, _, success) = run_facts(&config_path, &["status"]);
    assert!(success);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["last_id"], 0);
    assert_eq!(status["seen_hashes"], 0);

    run_facts(&config_path, &["run"]);
    let (stdout, _, _) = run_facts(&config_path, &["status"]);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["last_id"], 7);
    assert_eq!(status["seen_hashes"], 1);
}

#[test]
fn test_json_progress_goes_to_stderr() {
    let (_tmp, config_path) = setup_test_env(&[(5, REVENUE, 1)]);

    let (stdout, stderr, success) = run_facts(&config_path, &["run", "--progress", "json"]);
    assert!(success);
    summary(&stdout);
    assert!(stderr.contains(r#""event":"started""#));
    assert!(stderr.contains(r#""event":"batch""#));
}

#[test]
fn test_missing_corpus_fails() {
    let (tmp, config_path) = setup_test_env(&[(1, "x", 1)]);

    let missing = tmp.path().join("nope.db");
    let (_, stderr, success) =
        run_facts(&config_path, &["run", "--db-path", missing.to_str().unwrap()]);
    assert!(!success);
    assert!(!stderr.is_empty());
    assert!(!missing.exists());
}

#[test]
fn test_chat_backend_without_key_fails() {
    let (_tmp, config_path) = setup_test_env(&[(1, "x", 1)]);

    let output = Command::new(facts_binary())
        .arg("--config")
        .arg(&config_path)
        .args(["run", "--backend", "chat"])
        .env_remove("FACTS_API_KEY")
        .current_dir(config_path.parent().unwrap())
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_invalid_override_rejected() {
    let (_tmp, config_path) = setup_test_env(&[(1, "x", 1)]);

    let (_, stderr, success) = run_facts(&config_path, &["run", "--temperature", "3.5"]);
    assert!(!success);
    assert!(stderr.contains("temperature"));
}
