use std::fmt;
use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use crate::core::types::{Value, ValueType};

/// Meta attribute naming the layout of an event
pub const TYPE_ATTRIBUTE: &str = "type";
/// Meta attribute naming the timestamp of an event
pub const TIME_ATTRIBUTE: &str = "time";

/// What a predicate looks at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Extractor {
    Attribute(String),   // #type, #time
    Field(String),       // Field key, matched by dotted suffix
    Type(ValueType),     // Every field of the given type
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    In,        // Column value is a member of / contained in the operand
    NotIn,
    Ni,        // Column value contains the operand
    NotNi,
    Match,     // Regular expression, full match
    NotMatch,
}

impl RelOp {
    pub fn negate(self) -> RelOp {
        match self {
            RelOp::Equal => RelOp::NotEqual,
            RelOp::NotEqual => RelOp::Equal,
            RelOp::Less => RelOp::GreaterEqual,
            RelOp::LessEqual => RelOp::Greater,
            RelOp::Greater => RelOp::LessEqual,
            RelOp::GreaterEqual => RelOp::Less,
            RelOp::In => RelOp::NotIn,
            RelOp::NotIn => RelOp::In,
            RelOp::Ni => RelOp::NotNi,
            RelOp::NotNi => RelOp::Ni,
            RelOp::Match => RelOp::NotMatch,
            RelOp::NotMatch => RelOp::Match,
        }
    }

    /// Negative operators evaluate as the complement of their positive form
    pub fn is_negative(self) -> bool {
        matches!(self, RelOp::NotEqual | RelOp::NotIn | RelOp::NotNi | RelOp::NotMatch)
    }
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let op = match self {
            RelOp::Equal => "==",
            RelOp::NotEqual => "!=",
            RelOp::Less => "<",
            RelOp::LessEqual => "<=",
            RelOp::Greater => ">",
            RelOp::GreaterEqual => ">=",
            RelOp::In => "in",
            RelOp::NotIn => "!in",
            RelOp::Ni => "ni",
            RelOp::NotNi => "!ni",
            RelOp::Match => "~",
            RelOp::NotMatch => "!~",
        };
        f.write_str(op)
    }
}

/// Single relational test: `extractor op value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub extractor: Extractor,
    pub op: RelOp,
    pub value: Value,
}

impl Predicate {
    pub fn new(extractor: Extractor, op: RelOp, value: Value) -> Self {
        Predicate { extractor, op, value }
    }

    pub fn field(key: &str, op: RelOp, value: Value) -> Self {
        Predicate::new(Extractor::Field(key.to_string()), op, value)
    }

    pub fn of_type(value_type: ValueType, op: RelOp, value: Value) -> Self {
        Predicate::new(Extractor::Type(value_type), op, value)
    }

    pub fn time(op: RelOp, at: DateTime<Utc>) -> Self {
        Predicate::new(Extractor::Attribute(TIME_ATTRIBUTE.to_string()), op, Value::Time(at))
    }

    pub fn layout_name(name: &str) -> Self {
        Predicate::new(
            Extractor::Attribute(TYPE_ATTRIBUTE.to_string()),
            RelOp::Equal,
            Value::Str(name.to_string()),
        )
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.extractor {
            Extractor::Attribute(name) => write!(f, "#{}", name)?,
            Extractor::Field(key) => write!(f, "{}", key)?,
            Extractor::Type(t) => write!(f, ":{}", t)?,
        }
        write!(f, " {} {}", self.op, self.value)
    }
}

/// Boolean expression over predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Conjunction(Vec<Expression>),
    Disjunction(Vec<Expression>),
    Negation(Box<Expression>),
    Predicate(Predicate),
}

impl Expression {
    pub fn and(self, other: Expression) -> Expression {
        match self {
            Expression::Conjunction(mut xs) => {
                xs.push(other);
                Expression::Conjunction(xs)
            }
            x => Expression::Conjunction(vec![x, other]),
        }
    }

    pub fn or(self, other: Expression) -> Expression {
        match self {
            Expression::Disjunction(mut xs) => {
                xs.push(other);
                Expression::Disjunction(xs)
            }
            x => Expression::Disjunction(vec![x, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expression {
        Expression::Negation(Box::new(self))
    }

    /// Calls `f` for every predicate in the tree
    pub fn for_each_predicate<F: FnMut(&Predicate)>(&self, f: &mut F) {
        match self {
            Expression::Conjunction(xs) | Expression::Disjunction(xs) => {
                for x in xs {
                    x.for_each_predicate(f);
                }
            }
            Expression::Negation(x) => x.for_each_predicate(f),
            Expression::Predicate(p) => f(p),
        }
    }
}

impl From<Predicate> for Expression {
    fn from(pred: Predicate) -> Self {
        Expression::Predicate(pred)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let join = |f: &mut fmt::Formatter, xs: &[Expression], sep: &str| -> fmt::Result {
            f.write_str("(")?;
            for (i, x) in xs.iter().enumerate() {
                if i > 0 {
                    f.write_str(sep)?;
                }
                write!(f, "{}", x)?;
            }
            f.write_str(")")
        };
        match self {
            Expression::Conjunction(xs) => join(f, xs, " && "),
            Expression::Disjunction(xs) => join(f, xs, " || "),
            Expression::Negation(x) => write!(f, "! {}", x),
            Expression::Predicate(p) => write!(f, "{}", p),
        }
    }
}
