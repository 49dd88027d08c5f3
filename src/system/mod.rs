pub mod query;
pub mod worker;
pub mod flusher;
pub mod scheduler;
pub mod index;
