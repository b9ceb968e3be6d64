#[path = "../common/mod.rs"]
mod common;

use std::io::Write as _;
use std::thread;
use std::time::Duration;

use common::{seeded_engine, seeded_engine_with};
use relcore::{
    Engine, EngineConfig, EngineError, Filter, FindArgs, IsolationLevel, Operation, QueryClient,
    TransactionOptions, UniqueWhere, Value, WriteData,
};

fn newcomer(id: &str) -> WriteData {
    WriteData::new()
        .set("id", id)
        .set("name", "Noor Haddad")
        .set("email", format!("{id}@studio.com"))
        .set("role", "Sound Designer")
        .set("rate", 70)
}

fn freelancers(engine: &Engine) -> usize {
    engine.count("Freelancer", &FindArgs::new()).unwrap()
}

fn budget(engine: &Engine, project: &str) -> Value {
    engine
        .find_unique_or_throw("Project", &UniqueWhere::by("id", project), &FindArgs::new())
        .unwrap()["budget"]
        .clone()
}

#[test]
fn failed_interactive_transaction_leaves_no_trace() {
    let engine = seeded_engine();
    let err = engine
        .run_interactive(TransactionOptions::new(), |tx| {
            tx.create("Freelancer", &newcomer("f-010"), &FindArgs::new())?;
            tx.update(
                "Project",
                &UniqueWhere::by("id", "p-001"),
                &WriteData::new().set("budget", 1),
                &FindArgs::new(),
            )?;
            assert_eq!(tx.count("Freelancer", &FindArgs::new())?, 6);
            tx.create(
                "Freelancer",
                &newcomer("f-011").set("email", "sarah@designstudio.com"),
                &FindArgs::new(),
            )?;
            Ok(())
        })
        .unwrap_err();
    assert_eq!(err.code(), "UniqueConstraint");
    assert_eq!(freelancers(&engine), 5);
    assert_eq!(budget(&engine, "p-001"), Value::Int(35_000));
    assert_eq!(engine.open_transactions(), 0);
}

#[test]
fn successful_interactive_transaction_commits_everything() {
    let engine = seeded_engine();
    let created = engine
        .run_interactive(TransactionOptions::new(), |tx| {
            let projects = tx.delegate("Project")?;
            let assignments = tx.delegate("Assignment")?;
            projects.update(
                &UniqueWhere::by("id", "p-005"),
                &WriteData::new().set("status", Value::variant("IN_PROGRESS")),
                &FindArgs::new(),
            )?;
            assignments.create(
                &WriteData::new()
                    .set("id", "asn-007")
                    .set("projectId", "p-005")
                    .set("freelancerId", "f-003")
                    .set("role", "Video Editor")
                    .set("startDate", Value::datetime("2025-05-01"))
                    .set("status", "confirmed"),
                &FindArgs::new(),
            )
        })
        .unwrap();
    assert_eq!(created["id"], Value::from("asn-007"));
    let project = engine
        .delegate("Project")
        .unwrap()
        .find_unique_or_throw(&UniqueWhere::by("id", "p-005"), &FindArgs::new().count_relation("assignments", None))
        .unwrap();
    assert_eq!(project["status"], Value::variant("IN_PROGRESS"));
    assert!(matches!(&project["_count"], Value::Object(c) if c["assignments"] == Value::Int(1)));
}

#[test]
fn delegates_reject_unknown_types() {
    let engine = seeded_engine();
    let err = engine.delegate("Invoice").unwrap_err();
    assert_eq!(err.code(), "UnknownRecordType");
}

#[test]
fn read_committed_sees_commits_made_mid_transaction() {
    let engine = seeded_engine();
    let (before, after) = engine
        .run_interactive(TransactionOptions::new().isolation(IsolationLevel::ReadCommitted), |tx| {
            let before = tx.count("Freelancer", &FindArgs::new())?;
            engine.create("Freelancer", &newcomer("f-010"), &FindArgs::new())?;
            Ok((before, tx.count("Freelancer", &FindArgs::new())?))
        })
        .unwrap();
    assert_eq!((before, after), (5, 6));
}

#[test]
fn repeatable_read_keeps_its_begin_snapshot() {
    let engine = seeded_engine();
    let (before, after, seen) = engine
        .run_interactive(TransactionOptions::new().isolation(IsolationLevel::RepeatableRead), |tx| {
            let before = tx.count("Freelancer", &FindArgs::new())?;
            engine.create("Freelancer", &newcomer("f-010"), &FindArgs::new())?;
            let seen = tx.find_unique("Freelancer", &UniqueWhere::by("id", "f-010"), &FindArgs::new())?;
            Ok((before, tx.count("Freelancer", &FindArgs::new())?, seen))
        })
        .unwrap();
    assert_eq!((before, after), (5, 5));
    assert!(seen.is_none());
    assert_eq!(freelancers(&engine), 6);
}

#[test]
fn read_uncommitted_observes_pending_writes() {
    let engine = seeded_engine();
    engine
        .run_interactive(TransactionOptions::new(), |tx| {
            tx.create("Freelancer", &newcomer("f-010"), &FindArgs::new())?;
            let dirty = engine.run_interactive(
                TransactionOptions::new().isolation(IsolationLevel::ReadUncommitted),
                |reader| reader.count("Freelancer", &FindArgs::new()),
            )?;
            let committed = engine.count("Freelancer", &FindArgs::new())?;
            assert_eq!((dirty, committed), (6, 5));
            Ok(())
        })
        .unwrap();
    assert_eq!(freelancers(&engine), 6);
}

#[test]
fn serializable_transactions_exclude_other_writers() {
    let engine = seeded_engine_with(EngineConfig {
        default_timeout_ms: 150,
        ..EngineConfig::default()
    });
    let options = TransactionOptions::new()
        .isolation(IsolationLevel::Serializable)
        .timeout(Duration::from_secs(10));
    engine
        .run_interactive(options, |tx| {
            let err = engine
                .create("Freelancer", &newcomer("f-010"), &FindArgs::new())
                .unwrap_err();
            assert_eq!(err.code(), "TransactionTimeout");
            tx.create("Freelancer", &newcomer("f-011"), &FindArgs::new())?;
            Ok(())
        })
        .unwrap();
    engine.create("Freelancer", &newcomer("f-010"), &FindArgs::new()).unwrap();
    assert_eq!(freelancers(&engine), 7);
}

#[test]
fn saturated_slots_fail_fast_after_max_wait() {
    let engine = seeded_engine_with(EngineConfig {
        max_open_transactions: 1,
        default_max_wait_ms: 50,
        ..EngineConfig::default()
    });
    engine
        .run_interactive(TransactionOptions::new(), |tx| {
            assert_eq!(engine.open_transactions(), 1);
            let err = engine.count("Freelancer", &FindArgs::new()).unwrap_err();
            assert_eq!(err.code(), "TransactionAcquireTimeout");
            assert!(matches!(err, EngineError::TransactionAcquireTimeout { waited_ms } if waited_ms >= 40));
            tx.count("Freelancer", &FindArgs::new())
        })
        .unwrap();
    assert_eq!(engine.open_transactions(), 0);
    assert_eq!(freelancers(&engine), 5);
}

#[test]
fn expired_transactions_roll_back() {
    let engine = seeded_engine();
    let options = TransactionOptions::new().timeout(Duration::from_millis(20));

    let err = engine
        .run_interactive(options.clone(), |tx| {
            tx.create("Freelancer", &newcomer("f-010"), &FindArgs::new())?;
            thread::sleep(Duration::from_millis(60));
            Ok(())
        })
        .unwrap_err();
    assert_eq!(err.code(), "TransactionTimeout");

    let err = engine
        .run_interactive(options, |tx| {
            tx.create("Freelancer", &newcomer("f-011"), &FindArgs::new())?;
            thread::sleep(Duration::from_millis(60));
            tx.count("Freelancer", &FindArgs::new())
        })
        .unwrap_err();
    assert_eq!(err.code(), "TransactionTimeout");

    assert_eq!(engine.open_transactions(), 0);
    assert_eq!(freelancers(&engine), 5);
    engine.create("Freelancer", &newcomer("f-010"), &FindArgs::new()).unwrap();
}

#[test]
fn concurrent_increments_are_not_lost() {
    let engine = seeded_engine();
    thread::scope(|scope| {
        for _ in 0..4 {
            let engine = engine.clone();
            scope.spawn(move || {
                for _ in 0..25 {
                    engine
                        .update(
                            "Project",
                            &UniqueWhere::by("id", "p-004"),
                            &WriteData::new().increment("budget", 10),
                            &FindArgs::new(),
                        )
                        .unwrap();
                }
            });
        }
    });
    assert_eq!(budget(&engine, "p-004"), Value::Int(13_000));
}

#[test]
fn batches_share_one_transaction() {
    let engine = seeded_engine();
    let operations = vec![
        Operation::UpdateMany {
            record_type: "Assignment".into(),
            filter: Some(Filter::equals("projectId", "p-004")),
            data: WriteData::new().set("allocation", 50),
            limit: None,
            returning: None,
        },
        Operation::Count {
            record_type: "Assignment".into(),
            args: FindArgs::new().filter(Filter::equals("allocation", 50)),
            fields: Vec::new(),
        },
        Operation::Delete {
            record_type: "Freelancer".into(),
            target: UniqueWhere::by("id", "f-004"),
            args: FindArgs::new(),
        },
    ];
    let err = engine.run_batch(operations, TransactionOptions::new()).unwrap_err();
    assert_eq!(err.code(), "ForeignKey");
    let unchanged = engine
        .count("Assignment", &FindArgs::new().filter(Filter::equals("allocation", 50)))
        .unwrap();
    assert_eq!(unchanged, 0);
}

#[test]
fn config_files_drive_engine_limits() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
default_isolation = "repeatableRead"
max_open_transactions = 2

[planner]
max_depth = 2
max_fanout = 4
"#
    )
    .unwrap();
    let config = EngineConfig::load_or_default(Some(file.path())).unwrap();
    assert_eq!(config.default_isolation, IsolationLevel::RepeatableRead);
    assert_eq!(config.max_open_transactions, 2);
    assert_eq!(config.default_timeout_ms, 5_000);
    assert_eq!(EngineConfig::from_toml_str(&config.to_toml_string().unwrap()).unwrap(), config);

    let engine = seeded_engine_with(config);
    let err = engine
        .find_many("Project", &FindArgs::new().include("assignments", FindArgs::new()))
        .unwrap_err();
    assert_eq!(err.code(), "FanoutExceeded");

    let mut bad = tempfile::NamedTempFile::new().unwrap();
    writeln!(bad, "max_open_transactions = 0").unwrap();
    let err = EngineConfig::load(bad.path()).unwrap_err();
    assert!(err.to_string().contains("max_open_transactions"), "{err}");

    let mut unknown = tempfile::NamedTempFile::new().unwrap();
    writeln!(unknown, "max_connections = 4").unwrap();
    assert!(EngineConfig::load(unknown.path()).is_err());
}
