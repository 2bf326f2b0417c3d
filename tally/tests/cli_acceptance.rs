use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use tally_core::{ClientContext, EventRecord, EventStore, Params, SdkKey, SqliteStore};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("tally/events.db")
    }

    fn write_config(&self, contents: &str) {
        let path = self.xdg_config.join("tally/config.toml");
        fs::create_dir_all(path.parent().expect("missing config parent"))
            .expect("failed to create config directory");
        fs::write(path, contents).expect("failed to write config");
    }

    fn open_store(&self) -> SqliteStore {
        let store = SqliteStore::open(&self.db_path()).expect("failed to open db");
        store.run_migrations().expect("failed to migrate db");
        store
    }

    fn seed_event(&self, name: &str, params: &[(&str, &str)]) {
        let key = SdkKey::parse("pubKsecret").expect("invalid key");
        let ctx = ClientContext::new(&key, "UU1", "HU1", "com.example", "1.0");
        let params: Params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let record = EventRecord::create(name, params, None, &ctx).expect("invalid event");
        self.open_store().append(&record).expect("failed to seed event");
    }
}

/// Config pointing at a port nothing listens on
const UNREACHABLE_CONFIG: &str = r#"
[app]
sdk_key = "pubKsecret"
bundle_id = "com.example.cli"

[collector]
endpoint = "http://127.0.0.1:9/e/"
timeout_secs = 1
attempt_timeout_secs = 1
"#;

fn run_tally(env: &CliTestEnv, args: &[&str]) -> Output {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("tally"));

    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute tally: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "tally {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn status_without_config_reports_not_ready() {
    let env = CliTestEnv::new();

    let output = run_tally(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Public Key:      (not set)"), "got:\n{stdout}");
    assert!(stdout.contains("Status: Not ready"), "got:\n{stdout}");
    assert!(!env.db_path().exists(), "status should not create the database");
}

#[test]
fn status_with_config_reports_ready_without_secret() {
    let env = CliTestEnv::new();
    env.write_config(UNREACHABLE_CONFIG);
    env.seed_event("Seeded", &[]);

    let output = run_tally(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Public Key:      pubK"), "got:\n{stdout}");
    assert!(stdout.contains("Bundle ID:       com.example.cli"));
    assert!(stdout.contains("Pending Events:  1"), "got:\n{stdout}");
    assert!(stdout.contains("Status: Ready to deliver"));
    assert!(!stdout.contains("secret"), "secret leaked:\n{stdout}");
}

#[test]
fn pending_on_empty_database() {
    let env = CliTestEnv::new();

    let output = run_tally(&env, &["pending"]);
    assert_success(&["pending"], &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("No pending events."));
}

#[test]
fn pending_lists_stored_events_in_order() {
    let env = CliTestEnv::new();
    env.seed_event("First", &[("level", "1")]);
    env.seed_event("Second", &[]);

    let args = ["pending", "--json"];
    let output = run_tally(&env, &args);
    assert_success(&args, &output);

    let events: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("pending --json should print JSON");
    let events = events.as_array().expect("expected a JSON array");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["name"], "First");
    assert_eq!(events[0]["params"]["level"], "1");
    assert_eq!(events[1]["name"], "Second");

    let args = ["pending", "--limit", "1"];
    let output = run_tally(&env, &args);
    assert_success(&args, &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("First  level=1"), "got:\n{stdout}");
    assert!(!stdout.contains("Second"));
}

#[test]
fn send_without_key_fails() {
    let env = CliTestEnv::new();

    let output = run_tally(&env, &["send", "Launch"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to start tracker"));
}

#[test]
fn send_rejects_malformed_param() {
    let env = CliTestEnv::new();
    env.write_config(UNREACHABLE_CONFIG);

    let output = run_tally(&env, &["send", "Launch", "-p", "novalue"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("expected key=value"));
}

#[test]
fn send_rejects_name_with_query_delimiter() {
    let env = CliTestEnv::new();
    env.write_config(UNREACHABLE_CONFIG);

    let output = run_tally(&env, &["send", "Level#2", "--wait-secs", "1"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("must not contain '#'"));
    assert!(!env.db_path().exists(), "nothing should be stored");
}

#[test]
fn send_to_unreachable_collector_keeps_event_stored() {
    let env = CliTestEnv::new();
    env.write_config(UNREACHABLE_CONFIG);

    let args = ["send", "Purchase", "-p", "sku=gold", "--wait-secs", "1"];
    let output = run_tally(&env, &args);
    assert!(!output.status.success(), "delivery should not succeed");
    assert!(String::from_utf8_lossy(&output.stderr).contains("still pending"));

    let pending = env.open_store().list_pending(10).expect("failed to list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "Purchase");
    assert_eq!(pending[0].params.get("sku").map(String::as_str), Some("gold"));
}

#[test]
fn flush_with_nothing_pending() {
    let env = CliTestEnv::new();
    env.write_config(UNREACHABLE_CONFIG);

    let output = run_tally(&env, &["flush"]);
    assert_success(&["flush"], &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("No pending events to flush."));
}

#[test]
fn verbose_writes_log_file() {
    let env = CliTestEnv::new();

    let output = run_tally(&env, &["--verbose", "status"]);
    assert_success(&["--verbose", "status"], &output);

    let log_dir = env.xdg_state.join("tally");
    let has_log = fs::read_dir(&log_dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.file_name().to_string_lossy().starts_with("tally.log"))
        })
        .unwrap_or(false);
    assert!(has_log, "expected a log file in {}", log_dir.display());
}
