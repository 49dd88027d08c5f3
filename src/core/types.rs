use std::fmt;
use std::net::IpAddr;
use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use crate::core::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl EventId {
    pub fn new(id: u64) -> Self {
        EventId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for EventId {
    fn from(id: u64) -> Self {
        EventId(id)
    }
}

/// Scalar types a column can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Int,
    Count,
    Real,
    Time,
    Str,
    Addr,
    Subnet,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Count => "count",
            ValueType::Real => "real",
            ValueType::Time => "time",
            ValueType::Str => "string",
            ValueType::Addr => "addr",
            ValueType::Subnet => "subnet",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Count(u64),
    Real(f64),
    Time(DateTime<Utc>),
    Str(String),
    Addr(IpAddr),
    Subnet(Subnet),
    List(Vec<Value>),   // Operand only (set membership)
}

impl Value {
    /// Returns the scalar type, or None for null and lists
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null | Value::List(_) => None,
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Int(_) => Some(ValueType::Int),
            Value::Count(_) => Some(ValueType::Count),
            Value::Real(_) => Some(ValueType::Real),
            Value::Time(_) => Some(ValueType::Time),
            Value::Str(_) => Some(ValueType::Str),
            Value::Addr(_) => Some(ValueType::Addr),
            Value::Subnet(_) => Some(ValueType::Subnet),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn str(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{:+}", i),
            Value::Count(c) => write!(f, "{}", c),
            Value::Real(r) => write!(f, "{}", r),
            Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Addr(a) => write!(f, "{}", a),
            Value::Subnet(s) => write!(f, "{}", s),
            Value::List(xs) => {
                f.write_str("[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", x)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// IP network, stored with host bits cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subnet {
    network: IpAddr,
    length: u8,
}

impl Subnet {
    pub fn new(addr: IpAddr, length: u8) -> Result<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if length > max {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("prefix length {} exceeds {} for {}", length, max, addr),
            ));
        }
        Ok(Subnet {
            network: mask(addr, length),
            length,
        })
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn length(&self) -> u8 {
        self.length
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(*addr, self.length) == self.network
            }
            _ => false,
        }
    }

    pub fn contains_subnet(&self, other: &Subnet) -> bool {
        other.length >= self.length && self.contains(&other.network)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.length)
    }
}

fn mask(addr: IpAddr, length: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if length == 0 { 0 } else { u32::MAX << (32 - length as u32) };
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = if length == 0 { 0 } else { u128::MAX << (128 - length as u32) };
            IpAddr::V6((bits & mask).into())
        }
    }
}
