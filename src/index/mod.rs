pub mod ids;
pub mod column_index;
pub mod table_index;
pub mod partition_cache;
