#![allow(missing_docs)]

use quarry::query::ast::{CompareOp, Operand, Predicate, Selection};
use quarry::query::compiler::{compile, Compiler, InMemoryIndexMetadata};
use quarry::query::slice::MAX_SENTINEL;
use quarry::query::{
    parse, parse_filter, CompileError, ErrorWithCode, IrNode, ParseError, QuerySlice, RangeBound,
    RangeValue, SliceNode, SortPredicate,
};

fn ir(text: &str) -> IrNode {
    let filter = parse_filter(text).expect("parse");
    compile(&filter).expect("compile")
}

fn single_slice(node: &IrNode) -> &QuerySlice {
    let slices = node.as_slice().expect("slice node");
    assert_eq!(slices.len(), 1, "expected one slice in {node:?}");
    &slices.slices()[0]
}

fn str_value(text: &str) -> RangeValue {
    RangeValue::Str(text.to_owned())
}

#[test]
fn equality_is_an_inclusive_point_range() {
    let node = ir("a = 5");
    let slice = single_slice(&node);
    assert_eq!(slice.property, "a");
    assert_eq!(slice.start, Some(RangeBound::inclusive(RangeValue::Int(5))));
    assert_eq!(slice.finish, Some(RangeBound::inclusive(RangeValue::Int(5))));
}

#[test]
fn comparisons_leave_one_side_open() {
    let lt = ir("a < 5");
    assert_eq!(single_slice(&lt).start, None);
    assert_eq!(
        single_slice(&lt).finish,
        Some(RangeBound::exclusive(RangeValue::Int(5)))
    );

    let lte = ir("a <= 5");
    assert_eq!(
        single_slice(&lte).finish,
        Some(RangeBound::inclusive(RangeValue::Int(5)))
    );

    let gt = ir("a > 5");
    assert_eq!(
        single_slice(&gt).start,
        Some(RangeBound::exclusive(RangeValue::Int(5)))
    );
    assert_eq!(single_slice(&gt).finish, None);

    let gte = ir("a gte 5");
    assert_eq!(
        single_slice(&gte).start,
        Some(RangeBound::inclusive(RangeValue::Int(5)))
    );
}

#[test]
fn contains_targets_the_lowercased_keywords_field() {
    let node = ir("a contains 'FOO'");
    let slice = single_slice(&node);
    assert_eq!(slice.property, "a.keywords");
    assert_eq!(slice.start, Some(RangeBound::inclusive(str_value("foo"))));
    assert_eq!(slice.finish, Some(RangeBound::inclusive(str_value("foo"))));
}

#[test]
fn trailing_wildcard_becomes_a_prefix_range() {
    let node = ir("a contains 'foo*'");
    let slice = single_slice(&node);
    assert_eq!(slice.start, Some(RangeBound::inclusive(str_value("foo"))));
    assert_eq!(
        slice.finish,
        Some(RangeBound::inclusive(RangeValue::Str(format!(
            "foo{MAX_SENTINEL}"
        ))))
    );
    assert!(slice.matches(&str_value("food")));
    assert!(!slice.matches(&str_value("fop")));
}

#[test]
fn chained_conjunction_is_one_node_with_sibling_prepend_order() {
    let node = ir("a = 1 and b = 2 and c = 3");
    let slices = node.as_slice().expect("single slice node");
    let order: Vec<&str> = slices.slices().iter().map(|s| s.property.as_str()).collect();
    assert_eq!(order, ["b", "c", "a"]);
}

#[test]
fn disjunction_keeps_both_branches() {
    let node = ir("a = 1 or b = 2");
    let IrNode::Or(left, right) = node else {
        panic!("expected Or");
    };
    assert_eq!(single_slice(&left).property, "a");
    assert_eq!(single_slice(&right).property, "b");
}

#[test]
fn negation_wraps_the_slice_and_keeps_everything_else() {
    let node = ir("not b = 2");
    let IrNode::Not { subtract, keep } = node else {
        panic!("expected Not");
    };
    assert_eq!(single_slice(&subtract).property, "b");
    assert_eq!(keep, SliceNode::full_scan());
}

#[test]
fn range_and_negation_stay_separate() {
    let node = ir("a > 1 and not b = 2");
    let IrNode::And(left, right) = node else {
        panic!("expected And");
    };
    assert_eq!(
        single_slice(&left).start,
        Some(RangeBound::exclusive(RangeValue::Int(1)))
    );
    let IrNode::Not { subtract, .. } = *right else {
        panic!("expected Not on the right");
    };
    assert_eq!(single_slice(&subtract).property, "b");
}

#[test]
fn select_fields_and_filter_parse_together() {
    let ast = parse("select name, loc.city where age >= 3 && name = 'rex'").expect("parse");
    assert_eq!(
        ast.select,
        Selection::Fields(vec!["name".into(), "loc.city".into()])
    );
    assert_eq!(
        ast.filter,
        Some(Operand::and(
            Operand::Predicate(Predicate::Compare {
                property: "age".into(),
                op: CompareOp::Gte,
                value: RangeValue::Int(3),
            }),
            Operand::Predicate(Predicate::Compare {
                property: "name".into(),
                op: CompareOp::Eq,
                value: str_value("rex"),
            }),
        ))
    );
}

#[test]
fn plan_hash_depends_on_filter_and_projection() {
    let compiler = Compiler::default();
    let plan = |text: &str| compiler.plan(&parse(text).expect("parse")).expect("plan");
    let base = plan("select * where a = 1");
    assert_eq!(base.plan_hash, plan("a = 1").plan_hash);
    assert_ne!(base.plan_hash, plan("select * where a = 2").plan_hash);
    assert_ne!(base.plan_hash, plan("select a where a = 1").plan_hash);
}

#[test]
fn syntax_errors_report_their_position() {
    let err = parse("a = 1 b = 2").expect_err("trailing input");
    assert_eq!(err.offset(), Some(6));
    assert!(ErrorWithCode::parse(&err).to_string().starts_with('['));

    assert_eq!(parse("   "), Err(ParseError::Empty));
    assert!(matches!(
        parse("a = 'open"),
        Err(ParseError::UnterminatedString { offset: 4 })
    ));
}

#[test]
fn keywords_ignore_case() {
    assert_eq!(
        parse_filter("A = 1 AND NOT b LT 2").expect("parse"),
        parse_filter("A = 1 and not b < 2").expect("parse")
    );
}

#[test]
fn boolean_literals_become_point_ranges() {
    let node = ir("intersect = true and archived < true");
    let slices = node.as_slice().expect("single slice node");
    let intersect = slices.get("intersect").expect("intersect slice");
    assert_eq!(intersect.start, Some(RangeBound::inclusive(RangeValue::Bool(true))));
    assert_eq!(intersect.finish, Some(RangeBound::inclusive(RangeValue::Bool(true))));
    let archived = slices.get("archived").expect("archived slice");
    assert!(archived.matches(&RangeValue::Bool(false)));
    assert!(!archived.matches(&RangeValue::Bool(true)));
}

#[test]
fn order_by_is_carried_into_the_plan() {
    let ast = parse("select name where age > 2 order by age desc, name").expect("parse");
    assert_eq!(
        ast.to_string(),
        "select name where (age > 2) order by age desc, name asc"
    );
    let plan = Compiler::default().plan(&ast).expect("plan");
    assert_eq!(plan.sort, vec![SortPredicate::desc("age"), SortPredicate::asc("name")]);
    assert_eq!(plan.explain.op, "Sort");
    assert_eq!(plan.explain.inputs[0].op, "Slice");
}

#[test]
fn plan_hash_depends_on_ordering() {
    let compiler = Compiler::default();
    let plan = |text: &str| compiler.plan(&parse(text).expect("parse")).expect("plan");
    let unsorted = plan("a = 1").plan_hash;
    let asc = plan("a = 1 order by b").plan_hash;
    assert_ne!(unsorted, asc);
    assert_eq!(asc, plan("a = 1 order by b asc").plan_hash);
    assert_ne!(asc, plan("a = 1 order by b desc").plan_hash);
}

#[test]
fn sorting_on_an_unindexed_property_is_rejected() {
    let catalog = InMemoryIndexMetadata::new().with_indexed("a");
    let ast = parse("a = 1 order by b").expect("parse");
    let err = Compiler::new(&catalog).plan(&ast).expect_err("b is not indexed");
    assert_eq!(err, CompileError::NoIndex { property: "b".into() });
}
