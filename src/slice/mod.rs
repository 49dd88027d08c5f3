pub mod table_slice;
pub mod builder;
