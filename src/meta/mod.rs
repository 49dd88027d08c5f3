pub mod meta_index;
