#[path = "../common/mod.rs"]
mod common;

use common::{ids, seeded_engine};
use proptest::prelude::*;
use relcore::{
    Cursor, EngineConfig, FieldOp, Filter, FindArgs, NullsOrder, OrderBy, QueryClient, Row, UniqueWhere, Value,
};

#[test]
fn scalar_filters_and_store_order() {
    let engine = seeded_engine();
    let active = engine
        .find_many(
            "Project",
            &FindArgs::new().filter(Filter::in_list("status", [Value::variant("IN_PROGRESS")])),
        )
        .unwrap();
    assert_eq!(ids(&active), ["p-001", "p-004"]);

    let campaigns = engine
        .find_many(
            "Project",
            &FindArgs::new().filter(Filter::contains("title", "campaign").insensitive()),
        )
        .unwrap();
    assert_eq!(ids(&campaigns), ["p-002", "p-004"]);

    let open_ended = engine
        .find_many("Project", &FindArgs::new().filter(Filter::is_null("endDate")))
        .unwrap();
    assert_eq!(ids(&open_ended), ["p-005", "p-006"]);

    let started_2025 = engine
        .count(
            "Project",
            &FindArgs::new().filter(Filter::gte("startDate", Value::datetime("2025-01-01T00:00:00Z"))),
        )
        .unwrap();
    assert_eq!(started_2025, 5);
}

#[test]
fn empty_combinators_follow_boolean_identities() {
    let engine = seeded_engine();
    let count = |filter: Filter| engine.count("Freelancer", &FindArgs::new().filter(filter)).unwrap();
    assert_eq!(count(Filter::and([])), 5);
    assert_eq!(count(Filter::or([])), 0);
    assert_eq!(count(Filter::not([])), 5);
    assert_eq!(count(Filter::not([Filter::gt("rate", 70)])), 3);
}

#[test]
fn list_fields_support_membership() {
    let engine = seeded_engine();
    let react = engine
        .find_many("Freelancer", &FindArgs::new().filter(Filter::has("skills", "react")))
        .unwrap();
    assert_eq!(ids(&react), ["f-002"]);
    let no_skills = engine
        .find_many(
            "Freelancer",
            &FindArgs::new().filter(Filter::field("skills", FieldOp::IsEmpty(true))),
        )
        .unwrap();
    assert_eq!(ids(&no_skills), ["f-005"]);
}

#[test]
fn ordering_places_nulls_smallest_by_default() {
    let engine = seeded_engine();
    let by_budget = engine
        .find_many("Project", &FindArgs::new().order_by(OrderBy::desc("budget")).select(["id"]))
        .unwrap();
    assert_eq!(ids(&by_budget), ["p-005", "p-001", "p-003", "p-002", "p-004", "p-006"]);

    let nulls_first = engine
        .find_many(
            "Project",
            &FindArgs::new()
                .order_by(OrderBy::desc("budget").nulls(NullsOrder::First))
                .take(2),
        )
        .unwrap();
    assert_eq!(ids(&nulls_first), ["p-006", "p-005"]);

    let cheapest = engine
        .find_first("Freelancer", &FindArgs::new().order_by(OrderBy::asc("rate")))
        .unwrap()
        .unwrap();
    assert_eq!(cheapest["id"], Value::from("f-005"));
    let priciest = engine
        .find_first("Freelancer", &FindArgs::new().order_by(OrderBy::asc("rate")).take(-1))
        .unwrap()
        .unwrap();
    assert_eq!(priciest["id"], Value::from("f-002"));
}

#[test]
fn cursor_pages_forward_and_backward() {
    let engine = seeded_engine();
    let page = |cursor: &str, take: i64, skip: usize| {
        let rows = engine
            .find_many(
                "Project",
                &FindArgs::new()
                    .order_by(OrderBy::asc("id"))
                    .cursor(Cursor::by("id", cursor))
                    .take(take)
                    .skip(skip),
            )
            .unwrap();
        ids(&rows)
    };
    assert_eq!(page("p-004", 2, 0), ["p-004", "p-005"]);
    assert_eq!(page("p-004", 2, 1), ["p-005", "p-006"]);
    assert_eq!(page("p-004", -2, 0), ["p-002", "p-003"]);
    assert_eq!(page("p-002", -5, 0), ["p-001"]);
    assert!(page("p-001", -3, 0).is_empty());

    let missing = engine
        .find_many("Project", &FindArgs::new().cursor(Cursor::by("id", "p-404")).take(2))
        .unwrap_err();
    assert_eq!(missing.code(), "CursorNotFound");
    let not_unique = engine
        .find_many("Project", &FindArgs::new().cursor(Cursor::by("title", "TechCorp Rebrand")))
        .unwrap_err();
    assert_eq!(not_unique.code(), "InvalidField");
}

#[test]
fn relation_filters_quantify_over_related_records() {
    let engine = seeded_engine();
    let in_flight = Filter::is("project", Filter::equals("status", Value::variant("IN_PROGRESS")));
    let busy = engine
        .find_many(
            "Freelancer",
            &FindArgs::new().filter(Filter::some("assignments", in_flight.clone())),
        )
        .unwrap();
    assert_eq!(ids(&busy), ["f-001", "f-002", "f-004", "f-005"]);

    let idle = engine
        .find_many("Freelancer", &FindArgs::new().filter(Filter::none("assignments", in_flight)))
        .unwrap();
    assert_eq!(ids(&idle), ["f-003"]);

    let unstaffed = engine
        .find_many("Project", &FindArgs::new().filter(Filter::none("assignments", Filter::all())))
        .unwrap();
    assert_eq!(ids(&unstaffed), ["p-005", "p-006"]);

    let fully_confirmed = engine
        .find_many(
            "Project",
            &FindArgs::new().filter(Filter::and([
                Filter::every("assignments", Filter::equals("status", "confirmed")),
                Filter::some("assignments", Filter::all()),
            ])),
        )
        .unwrap();
    assert_eq!(ids(&fully_confirmed), ["p-001", "p-002", "p-004"]);

    let unowned = engine
        .count("Project", &FindArgs::new().filter(Filter::is_absent("owner")))
        .unwrap();
    assert_eq!(unowned, 6);
}

#[test]
fn projections_nest_relations_and_counts() {
    let engine = seeded_engine();
    let row = engine
        .find_unique(
            "Project",
            &UniqueWhere::by("id", "p-001"),
            &FindArgs::new().select(["title"]).include(
                "assignments",
                FindArgs::new()
                    .order_by(OrderBy::desc("allocation"))
                    .select(["role"])
                    .include("freelancer", FindArgs::new().select(["name"])),
            ),
        )
        .unwrap()
        .unwrap();
    assert_eq!(row.keys().collect::<Vec<_>>(), ["assignments", "title"]);
    let Value::List(assignments) = &row["assignments"] else {
        panic!("assignments should be a list: {row:?}");
    };
    assert_eq!(assignments.len(), 2);
    let Value::Object(first) = &assignments[0] else {
        panic!("nested rows are objects");
    };
    assert_eq!(first["role"], Value::from("Lead Designer"));
    let Value::Object(freelancer) = &first["freelancer"] else {
        panic!("to-one relations are objects");
    };
    assert_eq!(freelancer["name"], Value::from("Sarah Johnson"));

    let counted = engine
        .find_many(
            "Freelancer",
            &FindArgs::new()
                .select(["id"])
                .count_relation("assignments", Some(Filter::equals("status", "confirmed"))),
        )
        .unwrap();
    let counts: Vec<Value> = counted
        .iter()
        .map(|row| match &row["_count"] {
            Value::Object(counts) => counts["assignments"].clone(),
            other => other.clone(),
        })
        .collect();
    assert_eq!(
        counts,
        [1, 1, 1, 1, 1].map(Value::Int).to_vec(),
        "f-002's completed assignment is filtered out"
    );
}

#[test]
fn projection_errors_are_reported_before_reading() {
    let engine = seeded_engine();
    let err = engine
        .find_many("Project", &FindArgs::new().select(["title"]).omit(["budget"]))
        .unwrap_err();
    assert_eq!(err.code(), "AmbiguousSelectOmit");

    let cyclic = FindArgs::new().include(
        "assignments",
        FindArgs::new().include("project", FindArgs::new().include("assignments", FindArgs::new())),
    );
    let err = engine.find_many("Project", &cyclic).unwrap_err();
    assert_eq!(err.code(), "ProjectionCycle");

    let err = engine
        .find_many("Project", &FindArgs::new().include("sponsors", FindArgs::new()))
        .unwrap_err();
    assert_eq!(err.code(), "RelationNotLoadable");

    let err = engine
        .find_many("Project", &FindArgs::new().filter(Filter::equals("budgett", 1)))
        .unwrap_err();
    assert_eq!(err.code(), "InvalidField");

    let err = engine
        .find_many("Project", &FindArgs::new().filter(Filter::equals("budget", "lots")))
        .unwrap_err();
    assert_eq!(err.code(), "TypeMismatch");
}

#[test]
fn fanout_and_depth_limits_apply() {
    let mut config = EngineConfig::default();
    config.planner.max_fanout = 3;
    config.planner.max_depth = 1;
    let engine = common::seeded_engine_with(config);

    let err = engine
        .find_many("Project", &FindArgs::new().include("assignments", FindArgs::new()))
        .unwrap_err();
    assert_eq!(err.code(), "FanoutExceeded");

    let deep = FindArgs::new().include(
        "assignments",
        FindArgs::new().include("freelancer", FindArgs::new()),
    );
    let err = engine.find_many("Project", &deep).unwrap_err();
    assert_eq!(err.code(), "ProjectionTooDeep");
}

#[test]
fn distinct_keeps_first_record_per_key() {
    let engine = seeded_engine();
    let rows = engine
        .find_many("Assignment", &FindArgs::new().distinct(["projectId"]).select(["projectId"]))
        .unwrap();
    let projects: Vec<&Value> = rows.iter().map(|row| &row["projectId"]).collect();
    assert_eq!(
        projects,
        ["p-001", "p-002", "p-003", "p-004"].map(Value::from).iter().collect::<Vec<_>>()
    );
}

#[test]
fn explain_hash_ignores_literals() {
    let engine = seeded_engine();
    let args = |rate: i64| FindArgs::new().filter(Filter::gt("rate", rate)).take(2);
    let first = engine.explain("Freelancer", &args(10)).unwrap();
    let second = engine.explain("Freelancer", &args(90)).unwrap();
    assert_eq!(first.plan_hash, second.plan_hash);
    let other = engine
        .explain("Freelancer", &args(10).order_by(OrderBy::asc("rate")))
        .unwrap();
    assert_ne!(first.plan_hash, other.plan_hash);
    assert!(first.to_string().starts_with("Find type=Freelancer"));
}

fn rate(row: &Row) -> i64 {
    row["rate"].as_i64().unwrap_or_default()
}

fn name(row: &Row) -> &str {
    row["name"].as_str().unwrap_or_default()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn planned_filters_match_client_side_evaluation(
        lo in 40i64..100,
        hi in 40i64..100,
        prefix in prop::sample::select(vec!["S", "M", "E", "D", "A", "Z"]),
        negate in any::<bool>(),
    ) {
        let engine = seeded_engine();
        let range = Filter::and([Filter::gte("rate", lo), Filter::not([Filter::gt("rate", hi)])]);
        let mut filter = Filter::or([range, Filter::starts_with("name", prefix)]);
        if negate {
            filter = Filter::not([filter]);
        }
        let planned = engine.find_many("Freelancer", &FindArgs::new().filter(filter)).unwrap();

        let all = engine.find_many("Freelancer", &FindArgs::new()).unwrap();
        let expected: Vec<Row> = all
            .into_iter()
            .filter(|row| {
                let hit = (rate(row) >= lo && rate(row) <= hi) || name(row).starts_with(prefix);
                hit != negate
            })
            .collect();
        prop_assert_eq!(planned, expected);
    }

    #[test]
    fn backward_pages_never_include_the_anchor(anchor in 1usize..=6, take in 1i64..6) {
        let engine = seeded_engine();
        let anchor_id = format!("p-00{anchor}");
        let rows = engine
            .find_many(
                "Project",
                &FindArgs::new()
                    .order_by(OrderBy::asc("id"))
                    .cursor(Cursor::by("id", anchor_id.as_str()))
                    .take(-take),
            )
            .unwrap();
        let got = ids(&rows);
        let expected: Vec<String> = (1..anchor)
            .rev()
            .take(take as usize)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|n| format!("p-00{n}"))
            .collect();
        prop_assert!(!got.contains(&anchor_id));
        prop_assert_eq!(got, expected);
    }
}
