use std::net::IpAddr;
use std::sync::Arc;
use chrono::{Duration, Utc};
use shardex::core::types::{EventId, Subnet, Value, ValueType};
use shardex::query::ast::{Expression, Predicate, RelOp};
use shardex::schema::layout::RecordLayout;
use shardex::slice::builder::TableSliceBuilder;
use shardex::system::query::QueryEvent;
use shardex::{Config, Index};

fn main() -> shardex::Result<()> {
    let storage = std::env::temp_dir().join("shardex-demo");
    let config = Config {
        max_partition_size: 1_000,
        in_mem_partitions: 2,
        ..Config::default()
    }
    .with_storage_path(storage.clone());
    let index = Index::open(config)?;

    let layout = Arc::new(
        RecordLayout::new("zeek.conn")
            .with_field("id.orig_h", ValueType::Addr)
            .with_field("id.resp_p", ValueType::Count)
            .with_field("service", ValueType::Str),
    );
    let start = Utc::now();
    let mut builder = TableSliceBuilder::new(layout, EventId(0));
    for batch in 0..5 {
        for i in 0..1_000u64 {
            let n = batch * 1_000 + i;
            let addr = IpAddr::from([192, 168, ((n / 256) % 256) as u8, (n % 256) as u8]);
            let service = if n % 3 == 0 { "dns" } else { "http" };
            builder.add(
                start + Duration::seconds(n as i64),
                vec![Value::Addr(addr), Value::Count(n % 1024), Value::str(service)],
            );
        }
        index.ingest(builder.finish()?)?;
    }
    println!("Ingested 5000 events into {}", storage.display());

    let net = Subnet::new(IpAddr::from([192, 168, 1, 0]), 24)?;
    let expr = Expression::from(Predicate::field("orig_h", RelOp::In, Value::Subnet(net)))
        .and(Predicate::field("service", RelOp::Equal, Value::str("dns")).into());

    println!("Query: {}", expr);
    let response = index.query(expr)?;
    for event in response.events.iter() {
        match event {
            QueryEvent::Hits { partition, ids, progress } => {
                println!("  {} hits in {} ({}/{})", ids.len(), partition, progress.completed, progress.total);
            }
            QueryEvent::Done(summary) => {
                println!("Done: {} hits across {} partitions", summary.hits, summary.partitions);
                break;
            }
            QueryEvent::Failed(e) => {
                println!("Failed: {}", e);
                break;
            }
        }
    }

    for (key, value) in index.status()? {
        println!("{:<40} {}", key, value);
    }
    index.shutdown()
}
