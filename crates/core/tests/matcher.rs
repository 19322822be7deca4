use apidrive::{matches, Expression, FailureKind, MatchResult, Predicate};
use serde_json::{json, Value};
use test_case::test_case;

async fn passes(expr: impl Into<Expression>, actual: Value) -> bool {
    matches(&expr.into(), Some(&actual)).await.is_pass()
}

#[test_case(json!(1), json!(1), true ; "equal numbers")]
#[test_case(json!(1), json!(1.0), true ; "integer against float")]
#[test_case(json!("a"), json!("a"), true ; "equal strings")]
#[test_case(json!("a"), json!("b"), false ; "different strings")]
#[test_case(json!(null), json!(null), true ; "null")]
#[test_case(json!(true), json!(false), false ; "booleans")]
#[test_case(json!(1), json!("1"), false ; "number against string")]
#[tokio::test]
async fn literal_matches_iff_equal(expected: Value, actual: Value, pass: bool) {
    assert_eq!(passes(expected, actual).await, pass);
}

#[test_case(json!({"a": 1}), json!({"a": 1, "b": 2}), true ; "extra actual fields ignored")]
#[test_case(json!({"a": 1, "b": 2}), json!({"a": 1}), false ; "missing field fails")]
#[test_case(json!({"a": {"b": [1, 2]}}), json!({"a": {"b": [1, 2]}}), true ; "nested")]
#[test_case(json!([1, 2]), json!([1, 2, 3]), false ; "array length differs")]
#[test_case(json!([1, 2]), json!([2, 1]), false ; "array order matters")]
#[test_case(json!({"a": 1}), json!([1]), false ; "object against array")]
#[tokio::test]
async fn structural_matching(expected: Value, actual: Value, pass: bool) {
    assert_eq!(passes(expected, actual).await, pass);
}

#[test_case(json!("$exists"), json!(0), true ; "exists on zero")]
#[test_case(json!("$exists"), json!(null), false ; "exists on null")]
#[test_case(json!("$string"), json!("x"), true ; "string on text")]
#[test_case(json!("$string"), json!(3), false ; "string on number")]
#[test_case(json!("$int"), json!(3), true ; "int on integer")]
#[test_case(json!("$int"), json!(3.0), true ; "int on whole float")]
#[test_case(json!("$int"), json!(3.5), false ; "int on fraction")]
#[test_case(json!("$date"), json!("2024-03-01T12:00:00Z"), true ; "date on rfc3339")]
#[test_case(json!("$date"), json!("2024-03-01"), true ; "date on plain date")]
#[test_case(json!("$date"), json!("yesterday-ish"), false ; "date on garbage")]
#[tokio::test]
async fn type_checks(expected: Value, actual: Value, pass: bool) {
    assert_eq!(passes(expected, actual).await, pass);
}

#[tokio::test]
async fn exists_on_absent_field_fails() {
    assert!(passes(json!({"title": "$exists"}), json!({"title": "x"})).await);
    assert!(!passes(json!({"title": "$exists"}), json!({})).await);
}

#[test_case(json!(1), json!(1) ; "literal")]
#[test_case(json!(1), json!(2) ; "literal mismatch")]
#[test_case(json!({"a": "$int"}), json!({"a": 1}) ; "object")]
#[test_case(json!({"a": "$int"}), json!({"a": "x"}) ; "object mismatch")]
#[test_case(json!("$exists"), json!(null) ; "check")]
#[tokio::test]
async fn not_is_exact_negation(inner: Value, actual: Value) {
    let plain = passes(inner.clone(), actual.clone()).await;
    let negated = passes(json!({ "$not": inner }), actual).await;
    assert_eq!(negated, !plain);
}

#[test_case(json!([1, 2, 3]) ; "already ordered")]
#[test_case(json!([3, 1, 2]) ; "rotated")]
#[test_case(json!([2, 3, 1]) ; "shuffled")]
#[tokio::test]
async fn unordered_accepts_any_permutation(actual: Value) {
    assert!(passes(json!({"$unordered": [1, 2, 3]}), actual).await);
}

#[tokio::test]
async fn unordered_rejects_length_mismatch() {
    assert!(!passes(json!({"$unordered": [1, 2]}), json!([2, 1, 3])).await);
    assert!(!passes(json!({"$unordered": [1, 2, 3]}), json!([1, 2])).await);
}

#[tokio::test]
async fn unordered_claims_each_actual_once() {
    assert!(!passes(json!({"$unordered": [1, 1]}), json!([1, 2])).await);
    assert!(passes(json!({"$unordered": [1, 1]}), json!([1, 1])).await);
}

#[test_case(json!(["a", "b", "c"]) ; "in order")]
#[test_case(json!(["c", "b", "a"]) ; "reversed")]
#[test_case(json!(["b", "c", "a"]) ; "interleaved")]
#[tokio::test]
async fn contains_ignores_order_and_extras(actual: Value) {
    assert!(passes(json!({"$contains": ["a", "b"]}), actual).await);
}

#[tokio::test]
async fn contains_fails_when_expected_outnumbers_actual() {
    assert!(!passes(json!({"$contains": ["a", "b", "c"]}), json!(["a", "b"])).await);
}

#[tokio::test]
async fn contains_with_nested_expressions() {
    let expected = json!({"$contains": [{"id": "$int", "name": "mia"}]});
    let actual = json!([{"id": 1, "name": "ella"}, {"id": 2, "name": "mia"}]);
    assert!(passes(expected, actual).await);
}

#[tokio::test]
async fn greedy_first_fit_is_order_sensitive() {
    // {$gt: 1} claims 2 before the literal 2 gets a chance
    assert!(!passes(json!({"$unordered": [{"$gt": 1}, 2]}), json!([2, 3])).await);
    assert!(passes(json!({"$unordered": [2, {"$gt": 1}]}), json!([2, 3])).await);
}

#[test_case(json!({"$length": 2}), json!([1, 2]), true ; "array length")]
#[test_case(json!({"$length": 3}), json!("abc"), true ; "string length")]
#[test_case(json!({"$length": 2}), json!({"a": 1}), false ; "object has no length")]
#[test_case(json!({"$gt": 1}), json!(2), true ; "gt")]
#[test_case(json!({"$gt": 2}), json!(2), false ; "gt equal")]
#[test_case(json!({"$gte": 2}), json!(2), true ; "gte equal")]
#[test_case(json!({"$lt": 2}), json!(1.5), true ; "lt")]
#[test_case(json!({"$lte": 2}), json!(3), false ; "lte above")]
#[test_case(json!({"$gt": 1}), json!("2"), false ; "comparison on text")]
#[test_case(json!({"$gt": 1, "$lt": 3}), json!(2), true ; "range conjunction")]
#[test_case(json!({"$gt": 1, "$lt": 3}), json!(4), false ; "range conjunction fails")]
#[tokio::test]
async fn length_and_comparisons(expected: Value, actual: Value, pass: bool) {
    assert_eq!(passes(expected, actual).await, pass);
}

#[tokio::test]
async fn pattern_matches_text_form() {
    let expr = Expression::pattern(r"^user-\d+$").unwrap();
    assert!(passes(expr.clone(), json!("user-42")).await);
    assert!(!passes(expr.clone(), json!("admin")).await);
    assert!(!matches(&expr, None).await.is_pass());
}

#[tokio::test]
async fn pattern_inside_object() {
    let expr = Expression::object([("email", Expression::pattern(r"@example\.com$").unwrap())]);
    assert!(passes(expr, json!({"email": "mia@example.com"})).await);
}

#[tokio::test]
async fn predicate_receives_actual() {
    let expr = Expression::predicate(|v| v.as_array().map_or(false, |a| a.len() > 1));
    assert!(passes(expr.clone(), json!([1, 2])).await);
    assert!(!passes(expr, json!([1])).await);
}

#[tokio::test]
async fn async_predicate_error_is_failure() {
    let expr = Expression::Predicate(Predicate::new(|_| async { Err::<bool, _>(anyhow::anyhow!("backend exploded")) }));
    match matches(&expr, Some(&json!(1))).await {
        MatchResult::Fail(m) => assert_eq!(m.kind, FailureKind::PredicateFailure),
        MatchResult::Pass => panic!("erroring predicate passed"),
    }
}

#[tokio::test]
async fn panicking_predicate_is_failure() {
    let expr = Expression::predicate(|_| panic!("predicate bug"));
    match matches(&expr, Some(&json!(1))).await {
        MatchResult::Fail(m) => assert_eq!(m.kind, FailureKind::PredicateFailure),
        MatchResult::Pass => panic!("panicking predicate passed"),
    }
}

#[tokio::test]
async fn failure_path_points_into_actual() {
    let expr = Expression::from(json!({"user": {"tags": ["a", "$int"]}}));
    match matches(&expr, Some(&json!({"user": {"tags": ["a", "b"]}}))).await {
        MatchResult::Fail(m) => {
            assert_eq!(m.kind, FailureKind::JsonExpressionFailure);
            assert_eq!(m.path, "$.user.tags[1]");
        }
        MatchResult::Pass => panic!("expected a mismatch"),
    }
}
