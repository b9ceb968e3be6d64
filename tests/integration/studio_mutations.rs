#[path = "../common/mod.rs"]
mod common;

use common::{ids, seeded_engine, ADMIN_EMAIL};
use relcore::{
    Filter, FindArgs, Operation, OperationResult, QueryClient, UniqueWhere, UpsertBranch, Value, WriteData,
};

fn freelancer(id: &str, email: &str, rate: i64) -> WriteData {
    WriteData::new()
        .set("id", id)
        .set("name", "Priya Natarajan")
        .set("email", email)
        .set("role", "Motion Designer")
        .set("rate", rate)
}

#[test]
fn duplicate_assignment_violates_compound_unique() {
    let engine = seeded_engine();
    let err = engine
        .create(
            "Assignment",
            &WriteData::new()
                .set("id", "asn-099")
                .set("projectId", "p-001")
                .set("freelancerId", "f-001")
                .set("role", "Second Designer")
                .set("startDate", Value::datetime("2025-02-01"))
                .set("status", "pending"),
            &FindArgs::new(),
        )
        .unwrap_err();
    assert_eq!(err.code(), "UniqueConstraint");
    assert!(
        err.to_string().contains("Assignment_freelancerId_projectId_key"),
        "unexpected message: {err}"
    );
    assert_eq!(engine.count("Assignment", &FindArgs::new()).unwrap(), 6);
}

#[test]
fn dangling_reference_is_a_foreign_key_violation() {
    let engine = seeded_engine();
    let err = engine
        .create(
            "Assignment",
            &WriteData::new()
                .set("projectId", "p-002")
                .set("freelancerId", "f-404")
                .set("role", "Ghost")
                .set("startDate", Value::datetime("2025-02-01"))
                .set("status", "pending"),
            &FindArgs::new(),
        )
        .unwrap_err();
    assert_eq!(err.code(), "ForeignKey");
}

#[test]
fn required_and_typed_fields_are_validated() {
    let engine = seeded_engine();
    let err = engine
        .create("Freelancer", &WriteData::new().set("name", "No Email"), &FindArgs::new())
        .unwrap_err();
    assert_eq!(err.code(), "MissingField");

    let err = engine
        .create("Freelancer", &freelancer("f-100", "p@studio.com", 0).set("rate", "expensive"), &FindArgs::new())
        .unwrap_err();
    assert_eq!(err.code(), "TypeMismatch");

    let err = engine
        .create("Freelancer", &freelancer("f-100", "p@studio.com", 80).set("shoeSize", 44), &FindArgs::new())
        .unwrap_err();
    assert_eq!(err.code(), "InvalidField");

    let err = engine
        .update(
            "Project",
            &UniqueWhere::by("id", "p-001"),
            &WriteData::new().set("status", Value::variant("ARCHIVED")),
            &FindArgs::new(),
        )
        .unwrap_err();
    assert_eq!(err.code(), "TypeMismatch");
    assert_eq!(engine.count("Freelancer", &FindArgs::new()).unwrap(), 5);
}

#[test]
fn defaults_fill_omitted_fields() {
    let engine = seeded_engine();
    let row = engine
        .create("Freelancer", &freelancer("f-100", "p@studio.com", 80), &FindArgs::new())
        .unwrap();
    assert_eq!(row["status"], Value::variant("ACTIVE"));
    assert_eq!(row["skills"], Value::List(Vec::new()));
    assert_eq!(row["bio"], Value::Null);

    let project = engine
        .create("Project", &WriteData::new().set("title", "Untitled"), &FindArgs::new())
        .unwrap();
    assert_eq!(project["status"], Value::variant("PLANNED"));
    assert!(matches!(project["updatedAt"], Value::DateTime(_)));
    assert!(matches!(&project["id"], Value::String(id) if !id.is_empty()));
}

#[test]
fn restrict_blocks_delete_until_cascade_clears_references() {
    let engine = seeded_engine();
    let err = engine
        .delete("Freelancer", &UniqueWhere::by("id", "f-003"), &FindArgs::new())
        .unwrap_err();
    assert_eq!(err.code(), "ForeignKey");
    assert_eq!(engine.count("Freelancer", &FindArgs::new()).unwrap(), 5);

    let deleted = engine
        .delete("Project", &UniqueWhere::by("id", "p-002"), &FindArgs::new().select(["title"]))
        .unwrap();
    assert_eq!(deleted["title"], Value::from("AutoMax Campaign Video"));
    let remaining = engine
        .find_many("Assignment", &FindArgs::new().filter(Filter::equals("freelancerId", "f-003")))
        .unwrap();
    assert!(remaining.is_empty());

    engine
        .delete("Freelancer", &UniqueWhere::by("id", "f-003"), &FindArgs::new())
        .unwrap();
    assert_eq!(engine.count("Freelancer", &FindArgs::new()).unwrap(), 4);
}

#[test]
fn connect_by_unique_field_and_set_null_on_delete() {
    let engine = seeded_engine();
    let admin = engine
        .find_unique_or_throw("User", &UniqueWhere::by("email", ADMIN_EMAIL), &FindArgs::new())
        .unwrap();

    let project = engine
        .update(
            "Project",
            &UniqueWhere::by("id", "p-001"),
            &WriteData::new().connect("owner", UniqueWhere::by("email", ADMIN_EMAIL)),
            &FindArgs::new().include("owner", FindArgs::new().select(["email"])),
        )
        .unwrap();
    assert_eq!(project["ownerId"], admin["id"]);
    let owner = match &project["owner"] {
        Value::Object(owner) => owner.clone(),
        other => panic!("owner not loaded: {other:?}"),
    };
    assert_eq!(owner["email"], Value::from(ADMIN_EMAIL));

    let owned = engine
        .find_many("Project", &FindArgs::new().filter(Filter::is("owner", Filter::equals("email", ADMIN_EMAIL))))
        .unwrap();
    assert_eq!(ids(&owned), ["p-001"]);

    engine
        .delete("User", &UniqueWhere::by("email", ADMIN_EMAIL), &FindArgs::new())
        .unwrap();
    let project = engine
        .find_unique_or_throw("Project", &UniqueWhere::by("id", "p-001"), &FindArgs::new())
        .unwrap();
    assert_eq!(project["ownerId"], Value::Null);
    assert_eq!(engine.count("Project", &FindArgs::new()).unwrap(), 6);
}

#[test]
fn missing_targets_report_record_not_found() {
    let engine = seeded_engine();
    let err = engine
        .update(
            "Project",
            &UniqueWhere::by("id", "p-404"),
            &WriteData::new().set("title", "Nope"),
            &FindArgs::new(),
        )
        .unwrap_err();
    assert_eq!(err.code(), "RecordNotFound");
    let err = engine
        .delete("Project", &UniqueWhere::by("id", "p-404"), &FindArgs::new())
        .unwrap_err();
    assert_eq!(err.code(), "RecordNotFound");
    let err = engine
        .find_unique_or_throw("Project", &UniqueWhere::by("id", "p-404"), &FindArgs::new())
        .unwrap_err();
    assert_eq!(err.code(), "RecordNotFound");
}

#[test]
fn upsert_is_idempotent() {
    let engine = seeded_engine();
    let target = UniqueWhere::by("email", "priya@motion.studio");
    let create = freelancer("f-006", "priya@motion.studio", 70);
    let update = WriteData::new().set("rate", 70);

    let first = engine
        .upsert("Freelancer", &target, &create, &update, &FindArgs::new())
        .unwrap();
    assert_eq!(first.branch, UpsertBranch::Created);
    let second = engine
        .upsert("Freelancer", &target, &create, &update, &FindArgs::new())
        .unwrap();
    assert_eq!(second.branch, UpsertBranch::Updated);
    assert_eq!(first.row, second.row);
    assert_eq!(engine.count("Freelancer", &FindArgs::new()).unwrap(), 6);
}

#[test]
fn arithmetic_updates_apply_to_current_values() {
    let engine = seeded_engine();
    let row = engine
        .update(
            "Project",
            &UniqueWhere::by("id", "p-001"),
            &WriteData::new().increment("budget", 5_000),
            &FindArgs::new().select(["budget"]),
        )
        .unwrap();
    assert_eq!(row["budget"], Value::Int(40_000));

    let row = engine
        .update(
            "Project",
            &UniqueWhere::by("id", "p-006"),
            &WriteData::new().increment("budget", 5_000),
            &FindArgs::new().select(["budget"]),
        )
        .unwrap();
    assert_eq!(row["budget"], Value::Null);

    let row = engine
        .update(
            "Freelancer",
            &UniqueWhere::by("id", "f-005"),
            &WriteData::new().push("skills", vec!["tiktok", "reels"]),
            &FindArgs::new().select(["skills"]),
        )
        .unwrap();
    assert_eq!(row["skills"], Value::from(vec!["tiktok", "reels"]));
}

#[test]
fn create_many_can_skip_duplicates() {
    let engine = seeded_engine();
    let rows = vec![
        freelancer("f-006", "priya@motion.studio", 70),
        freelancer("f-007", "sarah@designstudio.com", 70),
        freelancer("f-008", "priya@motion.studio", 70),
        freelancer("f-009", "jon@sound.studio", 55),
    ];
    let err = engine.create_many("Freelancer", &rows, false).unwrap_err();
    assert_eq!(err.code(), "UniqueConstraint");
    assert_eq!(engine.count("Freelancer", &FindArgs::new()).unwrap(), 5);

    let written = engine.create_many("Freelancer", &rows, true).unwrap();
    assert_eq!(written, 2);
    let added = engine
        .find_many("Freelancer", &FindArgs::new().filter(Filter::in_list("id", ["f-006", "f-009"])))
        .unwrap();
    assert_eq!(ids(&added), ["f-006", "f-009"]);
}

#[test]
fn bulk_writes_honor_limit_in_store_order() {
    let engine = seeded_engine();
    let requirements: Vec<WriteData> = (0..10)
        .map(|n| {
            WriteData::new()
                .set("projectId", "p-005")
                .set("role", format!("Crew {n}"))
        })
        .collect();
    assert_eq!(engine.create_many("RoleRequirement", &requirements, false).unwrap(), 10);

    let updated = engine
        .update_many_and_return(
            "RoleRequirement",
            Some(&Filter::equals("projectId", "p-005")),
            &WriteData::new().set("headcount", 2),
            Some(4),
            &FindArgs::new().select(["role", "headcount"]),
        )
        .unwrap();
    let roles: Vec<&Value> = updated.iter().map(|row| &row["role"]).collect();
    assert_eq!(
        roles,
        ["Crew 0", "Crew 1", "Crew 2", "Crew 3"].map(Value::from).iter().collect::<Vec<_>>()
    );
    assert_eq!(
        engine
            .count("RoleRequirement", &FindArgs::new().filter(Filter::equals("headcount", 2)))
            .unwrap(),
        4
    );

    let result = engine
        .execute(Operation::DeleteMany {
            record_type: "RoleRequirement".into(),
            filter: Some(Filter::equals("projectId", "p-005")),
            limit: Some(3),
            returning: Some(FindArgs::new().select(["role"])),
        })
        .unwrap();
    let OperationResult::Written(summary) = result else {
        panic!("unexpected result {result:?}");
    };
    assert_eq!(summary.count, 3);
    assert_eq!(summary.rows.map(|rows| rows.len()), Some(3));
    assert_eq!(engine.count("RoleRequirement", &FindArgs::new()).unwrap(), 7);
}

#[test]
fn update_many_rejects_relation_writes() {
    let engine = seeded_engine();
    let err = engine
        .update_many(
            "Project",
            None,
            &WriteData::new().connect("owner", UniqueWhere::by("email", ADMIN_EMAIL)),
            None,
        )
        .unwrap_err();
    assert_eq!(err.code(), "InvalidArgument");
}

#[test]
fn moodboard_links_cascade_from_both_sides() {
    let engine = seeded_engine();
    let collection = engine
        .create(
            "MoodboardCollection",
            &WriteData::new().set("projectId", "p-001").set("name", "Palette"),
            &FindArgs::new(),
        )
        .unwrap();
    let items = engine
        .create_many_and_return(
            "MoodboardItem",
            &[
                WriteData::new()
                    .set("projectId", "p-001")
                    .set("title", "Teal swatch")
                    .set("url", "https://cdn.example/teal.png")
                    .set("tags", vec!["color"]),
                WriteData::new()
                    .set("projectId", "p-001")
                    .set("title", "Logo sketch")
                    .set("url", "https://cdn.example/logo.png"),
            ],
            false,
            &FindArgs::new().select(["id"]),
        )
        .unwrap();
    for (position, item) in items.iter().enumerate() {
        engine
            .create(
                "MoodboardCollectionItem",
                &WriteData::new()
                    .set("collectionId", collection["id"].clone())
                    .set("itemId", item["id"].clone())
                    .set("position", position as i64),
                &FindArgs::new(),
            )
            .unwrap();
    }

    let err = engine
        .create(
            "MoodboardCollectionItem",
            &WriteData::new()
                .set("collectionId", collection["id"].clone())
                .set("itemId", items[0]["id"].clone()),
            &FindArgs::new(),
        )
        .unwrap_err();
    assert_eq!(err.code(), "UniqueConstraint");
    assert!(err.to_string().contains("MoodboardCollectionItem_collectionId_itemId_key"));

    let target = UniqueWhere::by("id", collection["id"].clone());
    let loaded = engine
        .find_unique_or_throw(
            "MoodboardCollection",
            &target,
            &FindArgs::new().include("items", FindArgs::new().select(["title"])).count_relation("entries", None),
        )
        .unwrap();
    let Value::List(linked) = &loaded["items"] else {
        panic!("items not loaded: {loaded:?}");
    };
    assert_eq!(linked.len(), 2);

    engine
        .delete("MoodboardItem", &UniqueWhere::by("id", items[0]["id"].clone()), &FindArgs::new())
        .unwrap();
    assert_eq!(engine.count("MoodboardCollectionItem", &FindArgs::new()).unwrap(), 1);

    engine
        .delete("Project", &UniqueWhere::by("id", "p-001"), &FindArgs::new())
        .unwrap();
    for record_type in ["MoodboardCollection", "MoodboardItem", "MoodboardCollectionItem", "Assignment"] {
        let left = engine
            .count(record_type, &FindArgs::new().filter(Filter::all()))
            .unwrap();
        let expected = if record_type == "Assignment" { 4 } else { 0 };
        assert_eq!(left, expected, "{record_type}");
    }
}

#[test]
fn one_to_one_relations_admit_a_single_holder() {
    let engine = seeded_engine();
    let source = engine
        .create(
            "KnowledgeSource",
            &WriteData::new()
                .set("projectId", "p-002")
                .set("title", "Client kickoff call")
                .set("kind", "call"),
            &FindArgs::new(),
        )
        .unwrap();
    let transcript = WriteData::new()
        .set("sourceId", source["id"].clone())
        .set("text", "Welcome everyone");
    engine.create("Transcript", &transcript, &FindArgs::new()).unwrap();
    let err = engine.create("Transcript", &transcript, &FindArgs::new()).unwrap_err();
    assert_eq!(err.code(), "Cardinality");

    let loaded = engine
        .find_unique_or_throw(
            "KnowledgeSource",
            &UniqueWhere::by("id", source["id"].clone()),
            &FindArgs::new().include("transcript", FindArgs::new().select(["text"])),
        )
        .unwrap();
    assert!(matches!(&loaded["transcript"], Value::Object(t) if t["text"] == Value::from("Welcome everyone")));

    engine
        .delete("Project", &UniqueWhere::by("id", "p-002"), &FindArgs::new())
        .unwrap();
    let orphan = engine
        .find_unique_or_throw("KnowledgeSource", &UniqueWhere::by("id", source["id"].clone()), &FindArgs::new())
        .unwrap();
    assert_eq!(orphan["projectId"], Value::Null);
    assert_eq!(engine.count("Transcript", &FindArgs::new()).unwrap(), 1);
}
