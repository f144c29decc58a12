pub mod batch;
pub mod config;
pub mod forward;
pub mod grammar;
pub mod kv_cache;
pub mod request;
pub mod sampling;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
