#[path = "../common/mod.rs"]
mod common;

use common::seeded_engine;
use proptest::prelude::*;
use relcore::{
    AggFunc, AggTarget, AggregateSpec, FieldOp, Filter, FindArgs, Having, QueryClient, SortOrder, Value,
};

fn open_statuses() -> Filter {
    Filter::in_list("status", [Value::variant("PLANNED"), Value::variant("IN_PROGRESS")])
}

#[test]
fn ungrouped_aggregates_fold_every_match() {
    let engine = seeded_engine();
    let result = engine
        .aggregate(
            "Freelancer",
            &AggregateSpec::new()
                .count_all()
                .with(AggFunc::Sum, "rate")
                .with(AggFunc::Avg, "rate")
                .with(AggFunc::Min, "rate")
                .with(AggFunc::Max, "rate"),
        )
        .unwrap();
    let row = result.single().unwrap();
    assert!(row.key.is_empty());
    assert_eq!(row.count_all(), Some(5));
    assert_eq!(row.sum["rate"], Value::Int(345));
    assert_eq!(row.avg["rate"], Value::Float(69.0));
    assert_eq!(row.min["rate"], Value::Int(50));
    assert_eq!(row.max["rate"], Value::Int(95));
}

#[test]
fn nulls_are_ignored_by_field_aggregates() {
    let engine = seeded_engine();
    let result = engine
        .aggregate(
            "Project",
            &AggregateSpec::new()
                .count_all()
                .with(AggFunc::Count, "budget")
                .with(AggFunc::Avg, "budget")
                .with(AggFunc::Max, "endDate"),
        )
        .unwrap();
    let row = result.single().unwrap();
    assert_eq!(row.count_all(), Some(6));
    assert_eq!(row.count["budget"], 5);
    assert_eq!(row.avg["budget"], Value::Float(26_000.0));
    assert_eq!(row.max["endDate"], Value::datetime("2025-04-10"));

    let counts = engine
        .count_fields("Project", &FindArgs::new(), &["budget".to_owned(), "endDate".to_owned()])
        .unwrap();
    assert_eq!(counts["_all"], 6);
    assert_eq!(counts["budget"], 5);
    assert_eq!(counts["endDate"], 4);
}

#[test]
fn empty_input_sums_to_zero_and_averages_to_null() {
    let engine = seeded_engine();
    let result = engine
        .aggregate(
            "Freelancer",
            &AggregateSpec::new()
                .filter(Filter::gt("rate", 1_000))
                .count_all()
                .with(AggFunc::Sum, "rate")
                .with(AggFunc::Avg, "rate")
                .with(AggFunc::Min, "rate"),
        )
        .unwrap();
    let row = result.single().unwrap();
    assert_eq!(row.count_all(), Some(0));
    assert_eq!(row.sum["rate"], Value::Int(0));
    assert_eq!(row.avg["rate"], Value::Null);
    assert_eq!(row.min["rate"], Value::Null);
}

#[test]
fn ungrouped_window_limits_the_folded_records() {
    let engine = seeded_engine();
    let result = engine
        .aggregate(
            "Freelancer",
            &AggregateSpec::new().count_all().with(AggFunc::Sum, "rate").take(2),
        )
        .unwrap();
    let row = result.single().unwrap();
    assert_eq!(row.count_all(), Some(2));
    assert_eq!(row.sum["rate"], Value::Int(170));
}

#[test]
fn groups_appear_in_first_seen_order() {
    let engine = seeded_engine();
    let result = engine
        .group_by(
            "Project",
            &AggregateSpec::new()
                .filter(open_statuses())
                .by(["status"])
                .count_all()
                .with(AggFunc::Sum, "budget"),
        )
        .unwrap();
    let summary: Vec<(Value, Option<i64>, Value)> = result
        .rows
        .iter()
        .map(|row| (row.key["status"].clone(), row.count_all(), row.sum["budget"].clone()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Value::variant("IN_PROGRESS"), Some(2), Value::Int(47_000)),
            (Value::variant("PLANNED"), Some(3), Value::Int(58_000)),
        ]
    );
}

#[test]
fn groups_can_be_ordered_by_aggregates() {
    let engine = seeded_engine();
    let result = engine
        .group_by(
            "Project",
            &AggregateSpec::new()
                .filter(open_statuses())
                .by(["status"])
                .count_all()
                .order_by(AggTarget::aggregate(AggFunc::Count, "_all"), SortOrder::Desc),
        )
        .unwrap();
    let statuses: Vec<&Value> = result.rows.iter().map(|row| &row.key["status"]).collect();
    assert_eq!(statuses, [&Value::variant("PLANNED"), &Value::variant("IN_PROGRESS")]);

    let result = engine
        .group_by(
            "Assignment",
            &AggregateSpec::new()
                .by(["projectId"])
                .count_all()
                .order_by(AggTarget::Field("projectId".into()), SortOrder::Desc)
                .take(2),
        )
        .unwrap();
    let projects: Vec<&Value> = result.rows.iter().map(|row| &row.key["projectId"]).collect();
    assert_eq!(projects, [&Value::from("p-004"), &Value::from("p-003")]);
    assert_eq!(result.rows[0].count_all(), Some(2));
}

#[test]
fn having_filters_on_unrequested_aggregates() {
    let engine = seeded_engine();
    let result = engine
        .group_by(
            "Project",
            &AggregateSpec::new()
                .by(["status"])
                .count_all()
                .having(Having::condition(
                    AggTarget::aggregate(AggFunc::Sum, "budget"),
                    FieldOp::Gt(Value::Int(50_000)),
                )),
        )
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    let row = &result.rows[0];
    assert_eq!(row.key["status"], Value::variant("PLANNED"));
    assert_eq!(row.count_all(), Some(3));
    assert!(row.sum.is_empty(), "unrequested aggregate leaked: {row:?}");

    let result = engine
        .group_by(
            "Project",
            &AggregateSpec::new().by(["status"]).count_all().having(Having::Or(vec![
                Having::condition(AggTarget::aggregate(AggFunc::Count, "_all"), FieldOp::Gte(Value::Int(3))),
                Having::condition(AggTarget::Field("status".into()), FieldOp::Equals(Value::variant("COMPLETED"))),
            ])),
        )
        .unwrap();
    let statuses: Vec<&Value> = result.rows.iter().map(|row| &row.key["status"]).collect();
    assert_eq!(statuses, [&Value::variant("PLANNED"), &Value::variant("COMPLETED")]);
}

#[test]
fn compound_keys_group_on_every_field() {
    let engine = seeded_engine();
    let result = engine
        .group_by(
            "Assignment",
            &AggregateSpec::new()
                .by(["freelancerId", "status"])
                .count_all()
                .with(AggFunc::Avg, "allocation"),
        )
        .unwrap();
    assert_eq!(result.rows.len(), 6);
    let marcus: Vec<&Value> = result
        .rows
        .iter()
        .filter(|row| row.key["freelancerId"] == Value::from("f-002"))
        .map(|row| &row.key["status"])
        .collect();
    assert_eq!(marcus, [&Value::from("confirmed"), &Value::from("completed")]);

    let json = serde_json::to_value(&result.rows[0]).unwrap();
    assert_eq!(json["_count"]["_all"], serde_json::json!(1));
    assert!(json.get("_sum").is_none());
}

#[test]
fn invalid_aggregations_are_rejected() {
    let engine = seeded_engine();
    let cases = [
        (AggregateSpec::new().count_all(), "InvalidAggregate", true),
        (AggregateSpec::new().with(AggFunc::Sum, "name"), "InvalidAggregate", false),
        (AggregateSpec::new().by(["skills"]).count_all(), "InvalidAggregate", false),
        (
            AggregateSpec::new()
                .count_all()
                .having(Having::condition(AggTarget::aggregate(AggFunc::Count, "_all"), FieldOp::Gt(Value::Int(1)))),
            "InvalidAggregate",
            false,
        ),
        (
            AggregateSpec::new()
                .by(["role"])
                .order_by(AggTarget::Field("rate".into()), SortOrder::Asc),
            "InvalidAggregate",
            false,
        ),
        (AggregateSpec::new().by(["shoeSize"]), "InvalidField", false),
    ];
    for (spec, code, grouped) in cases {
        let err = if grouped {
            engine.group_by("Freelancer", &spec).unwrap_err()
        } else {
            engine.aggregate("Freelancer", &spec).unwrap_err()
        };
        assert_eq!(err.code(), code, "{spec:?}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn group_counts_partition_the_filtered_records(threshold in 40i64..100) {
        let engine = seeded_engine();
        let filter = Filter::gte("rate", threshold);
        let grouped = engine
            .group_by(
                "Freelancer",
                &AggregateSpec::new().filter(filter.clone()).by(["availability"]).count_all(),
            )
            .unwrap();
        let total = engine
            .aggregate("Freelancer", &AggregateSpec::new().filter(filter.clone()).count_all())
            .unwrap();
        let summed: i64 = grouped.rows.iter().filter_map(|row| row.count_all()).sum();
        prop_assert_eq!(Some(summed), total.single().and_then(|row| row.count_all()));
        prop_assert_eq!(
            summed as usize,
            engine.count("Freelancer", &FindArgs::new().filter(filter)).unwrap()
        );
    }
}
