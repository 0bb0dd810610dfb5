use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn recall_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("recall");
    path
}

/// Temp environment with a config whose archives and store live inside
/// the temp dir, and whose embedding URL points at a closed port so no
/// real service is ever contacted.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("mail")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/vectors.db"

[archives]
chat_db = "{root}/chat.db"
mail_dir = "{root}/mail"

[embedding]
url = "http://127.0.0.1:9"
max_retries = 0
"#,
        root = root.display()
    );

    let config_path = root.join("config.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_recall(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = recall_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run recall binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_status_on_empty_store() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_recall(&config_path, &["status"]);
    assert!(success, "status failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("empty"));
}

#[test]
fn test_ingest_unknown_source_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_recall(&config_path, &["ingest", "--source", "telegram"]);
    assert!(!success);
    assert!(stderr.contains("unknown source"));
}

#[test]
fn test_ingest_bad_since_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) =
        run_recall(&config_path, &["ingest", "--source", "mail", "--since", "3w"]);
    assert!(!success);
    assert!(stderr.contains("unknown time unit"));
}

#[test]
fn test_ingest_empty_mail_dir_completes() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_recall(&config_path, &["ingest", "--source", "mail"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("0 chunks"));
}

#[test]
fn test_ingest_skips_chunks_when_embedding_unreachable() {
    let (tmp, config_path) = setup_test_env();

    // One valid message file in an allowed folder. With the embedding
    // service unreachable, the chunk is skipped but the run completes.
    let mbox = tmp.path().join("mail/INBOX.mbox");
    fs::create_dir_all(&mbox).unwrap();
    let rfc822 = "From: alice@example.com\r\n\
         To: bob@example.com\r\n\
         Subject: hello\r\n\
         Date: Thu, 15 Jun 2023 12:00:00 +0000\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         Just checking in.";
    let mut raw = format!("{}\n", rfc822.len()).into_bytes();
    raw.extend_from_slice(rfc822.as_bytes());
    raw.extend_from_slice(b"<plist>trailer</plist>");
    fs::write(mbox.join("1.emlx"), raw).unwrap();

    let (stdout, stderr, success) = run_recall(&config_path, &["ingest", "--source", "mail"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("0 chunks"));
    assert!(stdout.contains("skipped 1 chunks"));
}

#[test]
fn test_query_unknown_source_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) =
        run_recall(&config_path, &["query", "anything", "--source", "sms"]);
    assert!(!success);
    assert!(stderr.contains("unknown source"));
}
