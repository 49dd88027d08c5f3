use crate::core::types::{Value, ValueType};
use crate::query::ast::{Expression, Extractor, Predicate, RelOp, TIME_ATTRIBUTE, TYPE_ATTRIBUTE};
use crate::query::validator::is_compatible;
use crate::schema::layout::RecordLayout;

/// Structural check: can `expr` select any row of a table with `layout`?
/// Never consults bitmaps. A false answer guarantees an empty result; a true
/// answer may still yield nothing.
pub fn may_match(expr: &Expression, layout: &RecordLayout) -> bool {
    match expr {
        Expression::Conjunction(xs) => xs.iter().all(|x| may_match(x, layout)),
        Expression::Disjunction(xs) => xs.iter().any(|x| may_match(x, layout)),
        // The complement of an empty result is every row.
        Expression::Negation(_) => true,
        Expression::Predicate(pred) => predicate_resolves(pred, layout),
    }
}

fn predicate_resolves(pred: &Predicate, layout: &RecordLayout) -> bool {
    match &pred.extractor {
        Extractor::Attribute(name) if name == TYPE_ATTRIBUTE => {
            match (pred.op, &pred.value) {
                (RelOp::Equal, Value::Str(s)) => *s == layout.name,
                (RelOp::NotEqual, Value::Str(s)) => *s != layout.name,
                (RelOp::In, Value::List(xs)) => xs.iter().any(|x| matches!(x, Value::Str(s) if *s == layout.name)),
                (op, value) => is_compatible(ValueType::Str, op, value),
            }
        }
        Extractor::Attribute(name) if name == TIME_ATTRIBUTE => {
            is_compatible(ValueType::Time, pred.op, &pred.value)
        }
        // Unknown attributes must reach evaluation to be reported.
        Extractor::Attribute(_) => true,
        Extractor::Field(key) => layout
            .resolve(key)
            .into_iter()
            .any(|i| is_compatible(layout.fields[i].field_type, pred.op, &pred.value)),
        Extractor::Type(t) => {
            !layout.fields_of_type(*t).is_empty() && is_compatible(*t, pred.op, &pred.value)
        }
    }
}
