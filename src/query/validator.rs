use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Value, ValueType};
use crate::query::ast::RelOp;

/// Checks that `column op operand` is a well-typed test
pub fn check_operand(column: ValueType, op: RelOp, operand: &Value) -> Result<()> {
    if accepts(column, op, operand) {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::TypeMismatch,
            format!("cannot apply {} {} to a {} column", op, operand, column),
        ))
    }
}

pub fn is_compatible(column: ValueType, op: RelOp, operand: &Value) -> bool {
    accepts(column, op, operand)
}

fn accepts(column: ValueType, op: RelOp, operand: &Value) -> bool {
    match op {
        RelOp::Equal | RelOp::NotEqual => {
            operand.is_null() || operand.value_type() == Some(column)
        }
        RelOp::Less | RelOp::LessEqual | RelOp::Greater | RelOp::GreaterEqual => {
            operand.value_type() == Some(column)
        }
        RelOp::In | RelOp::NotIn => match (column, operand) {
            (_, Value::List(xs)) => xs
                .iter()
                .all(|x| x.is_null() || x.value_type() == Some(column)),
            (ValueType::Addr, Value::Subnet(_)) => true,
            (ValueType::Subnet, Value::Subnet(_)) => true,
            (ValueType::Str, Value::Str(_)) => true,
            _ => false,
        },
        RelOp::Ni | RelOp::NotNi => matches!(
            (column, operand),
            (ValueType::Str, Value::Str(_))
                | (ValueType::Subnet, Value::Addr(_))
                | (ValueType::Subnet, Value::Subnet(_))
        ),
        RelOp::Match | RelOp::NotMatch => {
            matches!((column, operand), (ValueType::Str, Value::Str(_)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Subnet;

    #[test]
    fn equality_needs_same_type_or_null() {
        assert!(is_compatible(ValueType::Int, RelOp::Equal, &Value::Int(1)));
        assert!(is_compatible(ValueType::Int, RelOp::NotEqual, &Value::Null));
        assert!(!is_compatible(ValueType::Int, RelOp::Equal, &Value::Count(1)));
        assert!(!is_compatible(ValueType::Int, RelOp::Less, &Value::Null));
    }

    #[test]
    fn membership_operands() {
        let net = Value::Subnet(Subnet::new("10.0.0.0".parse().unwrap(), 8).unwrap());
        assert!(is_compatible(ValueType::Addr, RelOp::In, &net));
        assert!(is_compatible(ValueType::Subnet, RelOp::Ni, &Value::Addr("10.1.2.3".parse().unwrap())));
        assert!(is_compatible(ValueType::Int, RelOp::In, &Value::List(vec![Value::Int(1), Value::Null])));
        assert!(!is_compatible(ValueType::Int, RelOp::In, &Value::List(vec![Value::str("x")])));
        assert!(!is_compatible(ValueType::Int, RelOp::Match, &Value::str("x")));
        let err = check_operand(ValueType::Addr, RelOp::Ni, &net).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
    }
}
