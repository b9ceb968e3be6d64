#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

const FIXTURE: &str = r#"{
    "enums": [{"name": "Level", "variants": ["JUNIOR", "SENIOR"]}],
    "types": [
        {
            "name": "Team",
            "scalars": [
                {"name": "id", "kind": "int", "default": "autoIncrement"},
                {"name": "name", "kind": "string"}
            ],
            "uniques": [
                {"name": "Team_pkey", "fields": ["id"], "primary": true},
                {"name": "Team_name_key", "fields": ["name"]}
            ]
        },
        {
            "name": "Member",
            "scalars": [
                {"name": "id", "kind": "int", "default": "autoIncrement"},
                {"name": "name", "kind": "string"},
                {"name": "level", "kind": {"enum": "Level"}},
                {"name": "teamId", "kind": "int"},
                {"name": "rate", "kind": "int", "nullable": true}
            ],
            "uniques": [{"name": "Member_pkey", "fields": ["id"], "primary": true}]
        }
    ],
    "relations": [
        {
            "owner": "Member",
            "name": "team",
            "target": "Team",
            "cardinality": "one",
            "nullable": false,
            "inverse": "members",
            "link": {"foreignKey": {"fields": ["teamId"], "references": ["id"], "onDelete": "cascade"}}
        },
        {
            "owner": "Team",
            "name": "members",
            "target": "Member",
            "cardinality": "many",
            "nullable": false,
            "inverse": "team",
            "link": "inverse"
        }
    ],
    "seed": [
        {"recordType": "Team", "rows": [{"name": "Core"}, {"name": "Web"}]},
        {"recordType": "Member", "rows": [
            {"name": "Ada", "level": "SENIOR", "teamId": 1, "rate": 120},
            {"name": "Brook", "level": "JUNIOR", "teamId": 1, "rate": 80},
            {"name": "Cy", "level": "SENIOR", "teamId": 2, "rate": 100},
            {"name": "Dee", "level": "JUNIOR", "teamId": 2}
        ]}
    ]
}"#;

struct Workspace {
    dir: TempDir,
    fixture: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let fixture = dir.path().join("team.json");
        fs::write(&fixture, FIXTURE).expect("write fixture");
        Self { dir, fixture }
    }

    fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).expect("write request");
        path
    }
}

const SENIORS: &str = r#"{
    "recordType": "Member",
    "where": {"field": {"field": "level", "op": {"equals": {"t": "String", "v": "SENIOR"}}}},
    "orderBy": [{"field": "rate", "direction": "desc"}],
    "select": ["name"]
}"#;

#[test]
fn check_summarizes_the_fixture() {
    let ws = Workspace::new();
    let output = cargo_bin_cmd!("relcore")
        .env_remove("RELCORE_CONFIG")
        .arg("check")
        .arg(&ws.fixture)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(
        text.contains("Team: 2 scalars, relations [members], uniques [Team_pkey, Team_name_key], seeded 2"),
        "{text}"
    );
    assert!(text.contains("Member: 5 scalars, relations [team], uniques [Member_pkey], seeded 4"), "{text}");
}

#[test]
fn check_emits_json() {
    let ws = Workspace::new();
    let output = cargo_bin_cmd!("relcore")
        .env_remove("RELCORE_CONFIG")
        .args(["--format", "json", "check"])
        .arg(&ws.fixture)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    let types = json["types"].as_array().expect("types array");
    assert_eq!(types.len(), 2);
    let member = types.iter().find(|t| t["name"] == "Member").expect("Member");
    assert_eq!(member["seeded"], 4);
}

#[test]
fn find_renders_rows_as_text() {
    let ws = Workspace::new();
    let request = ws.file("seniors.json", SENIORS);
    let output = cargo_bin_cmd!("relcore")
        .env_remove("RELCORE_CONFIG")
        .arg("find")
        .arg(&ws.fixture)
        .arg("--request")
        .arg(&request)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, [r#"{name: "Ada"}"#, r#"{name: "Cy"}"#, "(2 rows)"]);
}

#[test]
fn find_emits_tagged_json_values() {
    let ws = Workspace::new();
    let request = ws.file("seniors.json", SENIORS);
    let output = cargo_bin_cmd!("relcore")
        .env_remove("RELCORE_CONFIG")
        .args(["--format", "json", "find"])
        .arg(&ws.fixture)
        .arg("--request")
        .arg(&request)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    let rows = json.as_array().expect("row array");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"]["v"], "Ada");
    assert!(rows[0].get("rate").is_none());
}

#[test]
fn aggregate_groups_by_key() {
    let ws = Workspace::new();
    let request = ws.file(
        "by_team.json",
        r#"{"recordType": "Member", "by": ["teamId"], "countAll": true, "sum": ["rate"]}"#,
    );
    let output = cargo_bin_cmd!("relcore")
        .env_remove("RELCORE_CONFIG")
        .arg("aggregate")
        .arg(&ws.fixture)
        .arg("--request")
        .arg(&request)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        [
            "_count._all=2 _sum.rate=200 teamId=1",
            "_count._all=2 _sum.rate=100 teamId=2",
            "(2 groups)",
        ]
    );
}

#[test]
fn explain_prints_the_plan() {
    let ws = Workspace::new();
    let request = ws.file(
        "with_members.json",
        r#"{"recordType": "Team", "include": {"members": {"take": 1}}}"#,
    );
    let output = cargo_bin_cmd!("relcore")
        .env_remove("RELCORE_CONFIG")
        .arg("explain")
        .arg(&ws.fixture)
        .arg("--request")
        .arg(&request)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.starts_with("Find type=Team"), "{text}");
    assert!(text.contains("members"), "{text}");
    assert!(text.trim_end().lines().last().is_some_and(|line| line.starts_with("plan_hash=")), "{text}");
}

#[test]
fn batch_runs_operations_in_order() {
    let ws = Workspace::new();
    let request = ws.file(
        "batch.json",
        r#"{
            "operations": [
                {"op": "create", "recordType": "Team", "data": {"fields": {"name": {"set": {"t": "String", "v": "Ops"}}}}},
                {"op": "count", "recordType": "Team"}
            ]
        }"#,
    );
    let output = cargo_bin_cmd!("relcore")
        .env_remove("RELCORE_CONFIG")
        .arg("batch")
        .arg(&ws.fixture)
        .arg("--request")
        .arg(&request)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, [r#"#0: {id: 3, name: "Ops"}"#, "#1: count 3"]);
}

#[test]
fn engine_errors_exit_nonzero_with_their_code() {
    let ws = Workspace::new();
    let request = ws.file(
        "bad.json",
        r#"{"recordType": "Member", "where": {"field": {"field": "salary", "op": {"gt": {"t": "Int", "v": 1}}}}}"#,
    );
    let output = cargo_bin_cmd!("relcore")
        .env_remove("RELCORE_CONFIG")
        .arg("find")
        .arg(&ws.fixture)
        .arg("--request")
        .arg(&request)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("error:"), "{text}");
    assert!(text.contains("InvalidField"), "{text}");
}

#[test]
fn invalid_config_is_reported() {
    let ws = Workspace::new();
    let config = ws.file("engine.toml", "max_open_transactions = 0\n");
    let output = cargo_bin_cmd!("relcore")
        .arg("--config")
        .arg(&config)
        .arg("check")
        .arg(&ws.fixture)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("max_open_transactions"), "{text}");
}
