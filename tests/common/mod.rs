#![allow(dead_code)]

use std::sync::Arc;
use chrono::{DateTime, TimeZone, Utc};
use shardex::core::types::{EventId, Value, ValueType};
use shardex::query::ast::{Expression, Predicate, RelOp};
use shardex::schema::layout::RecordLayout;
use shardex::slice::builder::TableSliceBuilder;
use shardex::slice::table_slice::TableSlice;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn counts_layout() -> Arc<RecordLayout> {
    Arc::new(RecordLayout::new("test.count").with_field("value", ValueType::Count))
}

pub fn conn_layout() -> Arc<RecordLayout> {
    Arc::new(
        RecordLayout::new("zeek.conn")
            .with_field("id.orig_h", ValueType::Addr)
            .with_field("service", ValueType::Str)
            .with_field("duration", ValueType::Real),
    )
}

/// `count` rows of `test.count` starting at `first_id`; row i carries
/// `value = i` and timestamp `at(first_id + i)`.
pub fn counts(first_id: u64, count: u64) -> TableSlice {
    let mut builder = TableSliceBuilder::new(counts_layout(), EventId(first_id));
    for i in 0..count {
        builder.add(at((first_id + i) as i64), vec![Value::Count(i)]);
    }
    builder.finish().unwrap()
}

pub fn conns(first_id: u64, count: u64) -> TableSlice {
    let services = ["http", "dns", "ssh"];
    let mut builder = TableSliceBuilder::new(conn_layout(), EventId(first_id));
    for i in 0..count {
        let addr = format!("10.0.{}.{}", i / 250, i % 250).parse().unwrap();
        builder.add(
            at((first_id + i) as i64),
            vec![
                Value::Addr(addr),
                Value::str(services[(i % 3) as usize]),
                Value::Real(i as f64 / 10.0),
            ],
        );
    }
    builder.finish().unwrap()
}

pub fn value_is(v: u64) -> Expression {
    Predicate::field("value", RelOp::Equal, Value::Count(v)).into()
}
