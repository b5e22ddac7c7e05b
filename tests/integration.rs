use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const KEY_VARS: [&str; 6] = [
    "KMA_API_KEY",
    "DATA_GO_KR_SERVICE_KEY",
    "AIRKOREA_API_KEY",
    "KOSIS_API_KEY",
    "NIER_WATER_API_KEY",
    "VWORLD_API_KEY",
];

fn drq_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("drq");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::create_dir_all(root.join("case/gis")).unwrap();

    fs::write(
        root.join("location.json"),
        r#"[{"location_id": "LOC-001", "address_road": "Sejong-daero 110",
             "center_lat": 37.5665, "center_lon": 126.978}]"#,
    )
    .unwrap();

    // Address only: the planner has to geocode it.
    fs::write(
        root.join("address_only.json"),
        r#"[{"location_id": "LOC-001", "address_road": "Sejong-daero 110"}]"#,
    )
    .unwrap();

    // Feature square ~800 m east of the site centre.
    fs::write(
        root.join("case/gis/park.geojson"),
        r#"{"type": "Polygon", "coordinates": [[
            [126.98707, 37.5638], [126.99161, 37.5638], [126.99161, 37.5692],
            [126.98707, 37.5692], [126.98707, 37.5638]]]}"#,
    )
    .unwrap();

    fs::write(
        root.join("overlay_catalog.json"),
        r#"[{"id": "REQ-AUTO-GIS", "connector": "AUTO_GIS", "priority": 60,
             "run_mode": "ONCE", "target_table": "ZONING_OVERLAY",
             "upsert_keys": "overlay_id",
             "params": {"buffer_m": 500, "items": [
                 {"overlay_id": "OV-PARK", "feature_id": "park", "mode": "VECTOR",
                  "geometry_file": "gis/park.geojson"}]}}]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/case.sqlite"

[storage]
root = "{root}/case"

[http]
timeout_secs = 5
max_retries = 0

[[stations]]
id = "108"
name = "Seoul"
lat = 37.5714
lon = 126.9658
"#,
        root = root.display()
    );

    let config_path = config_dir.join("drq.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_drq(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = drq_binary();
    let mut cmd = Command::new(&binary);
    for var in KEY_VARS {
        cmd.env_remove(var);
    }
    let output = cmd
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run drq binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn path_arg(config_path: &Path, rel: &str) -> String {
    // config/drq.toml -> <root>/<rel>
    let root = config_path.parent().unwrap().parent().unwrap();
    root.join(rel).display().to_string()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_drq(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/case.sqlite").exists());
    assert!(tmp.path().join("case/reports").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_drq(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_drq(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_plan_dry_run_then_write() {
    let (_tmp, config_path) = setup_test_env();
    run_drq(&config_path, &["init"]);
    let location = path_arg(&config_path, "location.json");
    let (_, stderr, success) = run_drq(&config_path, &["table", "import", "LOCATION", &location]);
    assert!(success, "import failed: {}", stderr);

    let (stdout, stderr, success) = run_drq(&config_path, &["plan", "--dry-run"]);
    assert!(success, "plan --dry-run failed: {}", stderr);
    assert!(stdout.contains("REQ-AIRKOREA"));
    assert!(stdout.contains("REQ-KMA-ASOS"));
    // Coordinates already known.
    assert!(!stdout.contains("REQ-GEOCODE"));
    assert!(stdout.contains("nothing written"));

    // Dry run left the catalog absent.
    let (_, _, shown) = run_drq(&config_path, &["table", "show", "DATA_REQUESTS"]);
    assert!(!shown, "dry run must not write the catalog");

    let (stdout, stderr, success) = run_drq(&config_path, &["plan"]);
    assert!(success, "plan failed: {}", stderr);
    assert!(!stdout.contains("nothing written"));

    let (stdout, stderr, success) =
        run_drq(&config_path, &["table", "show", "DATA_REQUESTS", "--json"]);
    assert!(success, "show failed: {}", stderr);
    let rows: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let kma = rows
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["id"] == "REQ-KMA-ASOS")
        .expect("KMA request planned");
    assert!(kma["note"].as_str().unwrap().contains("missing env"));
}

#[test]
fn test_plan_geocodes_address_only_site() {
    let (_tmp, config_path) = setup_test_env();
    run_drq(&config_path, &["init"]);
    let location = path_arg(&config_path, "address_only.json");
    run_drq(&config_path, &["table", "import", "LOCATION", &location]);

    let (stdout, stderr, success) = run_drq(&config_path, &["plan", "--dry-run"]);
    assert!(success, "plan --dry-run failed: {}", stderr);
    assert!(stdout.contains("REQ-GEOCODE"));
    // Station lookup waits for coordinates.
    assert!(!stdout.contains("REQ-KMA-ASOS"));
}

#[test]
fn test_plan_is_stable() {
    let (_tmp, config_path) = setup_test_env();
    run_drq(&config_path, &["init"]);
    let location = path_arg(&config_path, "location.json");
    run_drq(&config_path, &["table", "import", "LOCATION", &location]);

    let (_, _, success) = run_drq(&config_path, &["plan"]);
    assert!(success);
    let (stdout, _, success) = run_drq(&config_path, &["plan"]);
    assert!(success);
    assert!(stdout.contains("added: 0"), "second plan added rows: {}", stdout);
}

#[test]
fn test_run_overlay_writes_report() {
    let (tmp, config_path) = setup_test_env();
    run_drq(&config_path, &["init"]);
    let location = path_arg(&config_path, "location.json");
    run_drq(&config_path, &["table", "import", "LOCATION", &location]);
    let catalog = path_arg(&config_path, "overlay_catalog.json");
    let (_, stderr, success) =
        run_drq(&config_path, &["table", "import", "DATA_REQUESTS", &catalog]);
    assert!(success, "catalog import failed: {}", stderr);

    let (stdout, stderr, success) = run_drq(&config_path, &["run", "--progress", "off"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("executed=1"));
    assert!(tmp.path().join("case/reports/_data_requests_run.json").exists());

    let (stdout, _, success) =
        run_drq(&config_path, &["table", "show", "ZONING_OVERLAY", "--json"]);
    assert!(success);
    assert!(stdout.contains("DISJOINT"));
    assert!(stdout.contains("OV-PARK"));

    // ONCE with healthy evidence: second run skips.
    let (stdout, _, success) = run_drq(&config_path, &["run", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("skipped=1"));
}

#[test]
fn test_run_only_unknown_id_warns() {
    let (_tmp, config_path) = setup_test_env();
    run_drq(&config_path, &["init"]);

    let (stdout, stderr, success) =
        run_drq(&config_path, &["run", "--only", "REQ-NOPE", "--progress", "off"]);
    assert!(success, "run failed: {}", stderr);
    assert!(stdout.contains("not in catalog"));
}

#[test]
fn test_evidence_import_refused() {
    let (_tmp, config_path) = setup_test_env();
    run_drq(&config_path, &["init"]);
    let location = path_arg(&config_path, "location.json");

    let (_, stderr, success) = run_drq(&config_path, &["table", "import", "EVIDENCE", &location]);
    assert!(!success);
    assert!(stderr.contains("append-only"));
}

#[test]
fn test_unknown_connector() {
    let (_tmp, config_path) = setup_test_env();
    run_drq(&config_path, &["init"]);

    let (stdout, _, success) = run_drq(&config_path, &["verify", "FTP"]);
    assert!(!success);
    assert!(stdout.contains("unknown connector"));
}

#[test]
fn test_verify_without_key_fails_cleanly() {
    let (_tmp, config_path) = setup_test_env();
    run_drq(&config_path, &["init"]);

    let (stdout, _, success) = run_drq(&config_path, &["verify", "KMA_ASOS"]);
    assert!(!success);
    assert!(stdout.contains("KMA_API_KEY"));
}

#[test]
fn test_completions() {
    let output = Command::new(drq_binary())
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("drq"));
}
