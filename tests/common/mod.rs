//! Studio schema and seed data shared by the integration suites.
#![allow(dead_code)]

use std::sync::{Arc, Once};

use relcore::{
    Cardinality, Engine, EngineConfig, EnumDef, FieldDefault, MemoryStore, QueryClient, RecordStore, RecordType,
    ReferentialAction, RelationSpec, Row, ScalarField, Schema, SchemaRegistry, Value, WriteData,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("RELCORE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_test_writer()
            .try_init();
    });
}

fn fk(owner: &str, name: &str, target: &str, field: &str, inverse: &str, action: ReferentialAction) -> RelationSpec {
    RelationSpec::foreign_key(owner, name, target, [field], ["id"])
        .with_inverse(inverse)
        .on_delete(action)
}

fn back(owner: &str, name: &str, target: &str, inverse: &str, cardinality: Cardinality) -> RelationSpec {
    RelationSpec::inverse(owner, name, target, cardinality).with_inverse(inverse)
}

/// The eleven studio record types, registered the way a binding layer would.
pub fn studio_schema() -> Arc<Schema> {
    let mut registry = SchemaRegistry::new();
    registry
        .register_enum(EnumDef::new("ProjectStatus", ["PLANNED", "IN_PROGRESS", "COMPLETED", "ON_HOLD"]))
        .unwrap();
    registry
        .register_enum(EnumDef::new("FreelancerStatus", ["ACTIVE", "INACTIVE"]))
        .unwrap();

    let types = [
        RecordType::new("User")
            .id(ScalarField::string("id").default_to(FieldDefault::Cuid))
            .unique_field(ScalarField::string("email"))
            .field(ScalarField::string("name").optional())
            .field(ScalarField::string("password"))
            .field(ScalarField::datetime("createdAt").default_to(FieldDefault::Now)),
        RecordType::new("Project")
            .id(ScalarField::string("id").default_to(FieldDefault::Cuid))
            .field(ScalarField::string("title"))
            .field(ScalarField::string("description").optional())
            .field(ScalarField::enumeration("status", "ProjectStatus").default_value(Value::variant("PLANNED")))
            .field(ScalarField::datetime("startDate").optional())
            .field(ScalarField::datetime("endDate").optional())
            .field(ScalarField::int("budget").optional())
            .field(ScalarField::string("client").optional())
            .field(ScalarField::string("ownerId").optional())
            .field(ScalarField::datetime("updatedAt").updated_at()),
        RecordType::new("RoleRequirement")
            .id(ScalarField::int("id").default_to(FieldDefault::AutoIncrement))
            .field(ScalarField::string("projectId"))
            .field(ScalarField::string("role"))
            .field(ScalarField::int("headcount").default_value(1)),
        RecordType::new("Freelancer")
            .id(ScalarField::string("id").default_to(FieldDefault::Cuid))
            .field(ScalarField::string("name"))
            .unique_field(ScalarField::string("email"))
            .field(ScalarField::string("role"))
            .field(ScalarField::int("rate"))
            .field(ScalarField::enumeration("status", "FreelancerStatus").default_value(Value::variant("ACTIVE")))
            .field(ScalarField::string("bio").optional())
            .field(ScalarField::string("location").optional())
            .field(ScalarField::string("availability").optional())
            .field(ScalarField::string("skills").list()),
        RecordType::new("Assignment")
            .id(ScalarField::string("id").default_to(FieldDefault::Cuid))
            .field(ScalarField::string("projectId"))
            .field(ScalarField::string("freelancerId"))
            .field(ScalarField::string("role"))
            .field(ScalarField::datetime("startDate"))
            .field(ScalarField::datetime("endDate").optional())
            .field(ScalarField::int("allocation").default_value(100))
            .field(ScalarField::string("status")),
        RecordType::new("MoodboardItem")
            .id(ScalarField::int("id").default_to(FieldDefault::AutoIncrement))
            .field(ScalarField::string("projectId"))
            .field(ScalarField::string("title"))
            .field(ScalarField::string("url"))
            .field(ScalarField::string("tags").list()),
        RecordType::new("MoodboardCollection")
            .id(ScalarField::int("id").default_to(FieldDefault::AutoIncrement))
            .field(ScalarField::string("projectId"))
            .field(ScalarField::string("name")),
        RecordType::new("MoodboardCollectionItem")
            .id(ScalarField::int("id").default_to(FieldDefault::AutoIncrement))
            .field(ScalarField::int("collectionId"))
            .field(ScalarField::int("itemId"))
            .field(ScalarField::int("position").default_value(0)),
        RecordType::new("Script")
            .id(ScalarField::int("id").default_to(FieldDefault::AutoIncrement))
            .field(ScalarField::string("projectId"))
            .field(ScalarField::string("title"))
            .field(ScalarField::string("content"))
            .field(ScalarField::int("version").default_value(1))
            .field(ScalarField::datetime("updatedAt").updated_at()),
        RecordType::new("KnowledgeSource")
            .id(ScalarField::int("id").default_to(FieldDefault::AutoIncrement))
            .field(ScalarField::string("projectId").optional())
            .field(ScalarField::string("title"))
            .field(ScalarField::string("kind")),
        RecordType::new("Transcript")
            .id(ScalarField::int("id").default_to(FieldDefault::AutoIncrement))
            .field(ScalarField::int("sourceId"))
            .field(ScalarField::string("text")),
    ];
    for ty in types {
        registry.register_type(ty).unwrap();
    }

    registry.register_unique("Assignment", ["freelancerId", "projectId"]).unwrap();
    registry.register_unique("MoodboardCollectionItem", ["collectionId", "itemId"]).unwrap();
    registry.register_unique("Transcript", ["sourceId"]).unwrap();

    let relations = [
        fk("Project", "owner", "User", "ownerId", "projects", ReferentialAction::SetNull),
        back("User", "projects", "Project", "owner", Cardinality::Many),
        fk("RoleRequirement", "project", "Project", "projectId", "roleRequirements", ReferentialAction::Cascade),
        back("Project", "roleRequirements", "RoleRequirement", "project", Cardinality::Many),
        fk("Assignment", "project", "Project", "projectId", "assignments", ReferentialAction::Cascade),
        back("Project", "assignments", "Assignment", "project", Cardinality::Many),
        fk("Assignment", "freelancer", "Freelancer", "freelancerId", "assignments", ReferentialAction::Restrict),
        back("Freelancer", "assignments", "Assignment", "freelancer", Cardinality::Many),
        fk("MoodboardItem", "project", "Project", "projectId", "moodboardItems", ReferentialAction::Cascade),
        back("Project", "moodboardItems", "MoodboardItem", "project", Cardinality::Many),
        fk("MoodboardCollection", "project", "Project", "projectId", "collections", ReferentialAction::Cascade),
        back("Project", "collections", "MoodboardCollection", "project", Cardinality::Many),
        fk(
            "MoodboardCollectionItem",
            "collection",
            "MoodboardCollection",
            "collectionId",
            "entries",
            ReferentialAction::Cascade,
        ),
        back("MoodboardCollection", "entries", "MoodboardCollectionItem", "collection", Cardinality::Many),
        fk("MoodboardCollectionItem", "item", "MoodboardItem", "itemId", "placements", ReferentialAction::Cascade),
        back("MoodboardItem", "placements", "MoodboardCollectionItem", "item", Cardinality::Many),
        RelationSpec::through(
            "MoodboardCollection",
            "items",
            "MoodboardItem",
            "MoodboardCollectionItem",
            "collection",
            "item",
        )
        .with_inverse("collections"),
        RelationSpec::through(
            "MoodboardItem",
            "collections",
            "MoodboardCollection",
            "MoodboardCollectionItem",
            "item",
            "collection",
        )
        .with_inverse("items"),
        fk("Script", "project", "Project", "projectId", "scripts", ReferentialAction::Cascade),
        back("Project", "scripts", "Script", "project", Cardinality::Many),
        fk("KnowledgeSource", "project", "Project", "projectId", "knowledgeSources", ReferentialAction::SetNull),
        back("Project", "knowledgeSources", "KnowledgeSource", "project", Cardinality::Many),
        fk("Transcript", "source", "KnowledgeSource", "sourceId", "transcript", ReferentialAction::Cascade),
        back("KnowledgeSource", "transcript", "Transcript", "source", Cardinality::One),
    ];
    for relation in relations {
        registry.register_relation(relation).unwrap();
    }
    registry.finalize().unwrap()
}

struct Freelancer<'a> {
    id: &'a str,
    name: &'a str,
    email: &'a str,
    role: &'a str,
    rate: i64,
    location: &'a str,
    availability: &'a str,
    skills: &'a [&'a str],
}

const FREELANCERS: [Freelancer<'static>; 5] = [
    Freelancer {
        id: "f-001",
        name: "Sarah Johnson",
        email: "sarah@designstudio.com",
        role: "Senior Graphic Designer",
        rate: 75,
        location: "America/New_York",
        availability: "High",
        skills: &["branding", "illustration"],
    },
    Freelancer {
        id: "f-002",
        name: "Marcus Chen",
        email: "marcus@techsolutions.com",
        role: "Full Stack Developer",
        rate: 95,
        location: "Asia/Tokyo",
        availability: "High",
        skills: &["react", "node"],
    },
    Freelancer {
        id: "f-003",
        name: "Elena Rodriguez",
        email: "elena@postproduction.com",
        role: "Video Editor",
        rate: 65,
        location: "America/Los_Angeles",
        availability: "Medium",
        skills: &["editing", "color"],
    },
    Freelancer {
        id: "f-004",
        name: "David Thompson",
        email: "david@wordsandwich.com",
        role: "Copywriter",
        rate: 60,
        location: "Europe/London",
        availability: "Medium",
        skills: &["copy"],
    },
    Freelancer {
        id: "f-005",
        name: "Alex Moreno",
        email: "alex@socialboost.com",
        role: "Social Media Manager",
        rate: 50,
        location: "America/Mexico_City",
        availability: "High",
        skills: &[],
    },
];

/// (id, title, status, start, end, budget, client)
const PROJECTS: [(&str, &str, &str, &str, Option<&str>, Option<i64>, &str); 6] = [
    ("p-001", "TechCorp Rebrand", "IN_PROGRESS", "2025-01-15", Some("2025-03-30"), Some(35_000), "TechCorp Inc."),
    ("p-002", "AutoMax Campaign Video", "PLANNED", "2025-02-01", Some("2025-02-28"), Some(18_000), "AutoMax Dealership"),
    ("p-003", "EcoBrands Website", "COMPLETED", "2024-11-01", Some("2025-01-15"), Some(25_000), "EcoBrands Co."),
    ("p-004", "Foodie Influencer Campaign", "IN_PROGRESS", "2025-01-10", Some("2025-04-10"), Some(12_000), "Culinary Delights"),
    ("p-005", "Nordic Outdoor Launch", "PLANNED", "2025-05-01", None, Some(40_000), "Nordic Outdoor"),
    ("p-006", "Harbor Museum Audio Guide", "PLANNED", "2025-06-01", None, None, "Harbor Museum"),
];

/// (id, project, freelancer, role, start, end, allocation, status)
const ASSIGNMENTS: [(&str, &str, &str, &str, &str, &str, i64, &str); 6] = [
    ("asn-001", "p-001", "f-001", "Lead Designer", "2025-01-15", "2025-02-15", 100, "confirmed"),
    ("asn-002", "p-001", "f-002", "Frontend Developer", "2025-02-01", "2025-03-15", 80, "confirmed"),
    ("asn-003", "p-002", "f-003", "Video Editor", "2025-02-01", "2025-02-20", 100, "confirmed"),
    ("asn-004", "p-003", "f-002", "Full Stack Developer", "2024-11-01", "2025-01-10", 90, "completed"),
    ("asn-005", "p-004", "f-005", "Content Creator", "2025-01-10", "2025-03-01", 70, "confirmed"),
    ("asn-006", "p-004", "f-004", "Copywriter", "2025-01-15", "2025-02-15", 60, "confirmed"),
];

pub const ADMIN_EMAIL: &str = "admin@studio.com";

/// Inserts the seed rows through the engine.
pub fn seed(engine: &Engine) {
    engine
        .create(
            "User",
            &WriteData::new()
                .set("email", ADMIN_EMAIL)
                .set("name", "Studio Admin")
                .set("password", "$2a$10$seeded"),
            &Default::default(),
        )
        .unwrap();

    let freelancers: Vec<WriteData> = FREELANCERS
        .iter()
        .map(|f| {
            WriteData::new()
                .set("id", f.id)
                .set("name", f.name)
                .set("email", f.email)
                .set("role", f.role)
                .set("rate", f.rate)
                .set("location", f.location)
                .set("availability", f.availability)
                .set("skills", f.skills.to_vec())
        })
        .collect();
    engine.create_many("Freelancer", &freelancers, false).unwrap();

    let projects: Vec<WriteData> = PROJECTS
        .iter()
        .map(|(id, title, status, start, end, budget, client)| {
            WriteData::new()
                .set("id", *id)
                .set("title", *title)
                .set("status", Value::variant(*status))
                .set("startDate", Value::datetime(start))
                .set("endDate", end.map(Value::datetime))
                .set("budget", *budget)
                .set("client", *client)
        })
        .collect();
    engine.create_many("Project", &projects, false).unwrap();

    let assignments: Vec<WriteData> = ASSIGNMENTS
        .iter()
        .map(|(id, project, freelancer, role, start, end, allocation, status)| {
            WriteData::new()
                .set("id", *id)
                .set("projectId", *project)
                .set("freelancerId", *freelancer)
                .set("role", *role)
                .set("startDate", Value::datetime(start))
                .set("endDate", Value::datetime(end))
                .set("allocation", *allocation)
                .set("status", *status)
        })
        .collect();
    engine.create_many("Assignment", &assignments, false).unwrap();
}

pub fn seeded_engine() -> Engine {
    seeded_engine_with(EngineConfig::default())
}

pub fn seeded_engine_with(config: EngineConfig) -> Engine {
    init_tracing();
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let engine = Engine::new(studio_schema(), store, config).unwrap();
    seed(&engine);
    engine
}

/// String ids of `rows`, in order.
pub fn ids(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .map(|row| match row.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        })
        .collect()
}
