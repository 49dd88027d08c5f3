pub mod core;
pub mod schema;
pub mod slice;
pub mod query;
pub mod index;
pub mod storage;
pub mod meta;
pub mod system;

pub use crate::core::config::Config;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::index::ids::Ids;
pub use crate::system::index::Index;

/*
┌────────────────────────────────────────────────────────────────────────────────────┐
│                              SHARDEX STRUCT ARCHITECTURE                            │
└────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── SYSTEM LAYER ──────────────────────────────────┐
│                                                                                    │
│  ┌──────────────────────────────────────────────────────────────────────────────┐ │
│  │ struct Index                      // Blocking handle, owns the event loop    │ │
│  │ requests: Sender<Request>         // Ingest/Query/Cancel/Flush/Status        │ │
│  └──────────────────────────────────────────────────────────────────────────────┘ │
│                                       │                                            │
│  ┌──────────────────────────────────────────────────────────────────────────────┐ │
│  │ struct IndexScheduler             // Single-threaded state machine           │ │
│  │ active: PartitionHandle           // Ingesting partition, never cached       │ │
│  │ unpersisted: HashMap<Id, Handle>  // Sealed, flush pending                   │ │
│  │ cache: SharedPartitionCache       // LRU of sealed partitions                │ │
│  │ meta: MetaIndex                   // Pruning synopses                        │ │
│  │ pending: HashMap<QueryId, ..>     // Pending-query table                     │ │
│  │ ready: VecDeque<QueryId>          // Round-robin order                       │ │
│  │ idle: Vec<WorkerId>               // Idle worker stack                       │ │
│  └──────────────────────────────────────────────────────────────────────────────┘ │
│            │ Job                                  ▲ JobResult / FlushResult        │
│  ┌─────────▼──────────┐  ┌────────────────────┐  │                                │
│  │ WorkerPool         │  │ Flusher            │──┘                                │
│  │ N named threads    │  │ sealed -> disk     │                                   │
│  └────────────────────┘  └────────────────────┘                                   │
└────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── INDEX LAYER ───────────────────────────────────┐
│                                                                                    │
│  Partition ── meta: PartitionMeta { types: digest -> RecordLayout, events }        │
│      │                                                                             │
│      └── TableIndex (one per layout digest, opened lazily)                         │
│              ├── row_ids: Ids                                                      │
│              ├── time column: ColumnIndex(Time)                                    │
│              └── columns: Vec<Option<ColumnIndex>>   // value -> Ids, nulls        │
│                                                                                    │
└────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── STORAGE LAYOUT ────────────────────────────────┐
│                                                                                    │
│  <storage>/meta-index                                                              │
│  <storage>/<partition>/meta                                                        │
│  <storage>/<partition>/<digest>/row_ids                                            │
│  <storage>/<partition>/<digest>/meta/time.idx                                      │
│  <storage>/<partition>/<digest>/data/<column>.idx                                  │
│                                                                                    │
│  Every file: bincode { version, crc32, original_size, lz4(payload) }               │
└────────────────────────────────────────────────────────────────────────────────────┘
*/
