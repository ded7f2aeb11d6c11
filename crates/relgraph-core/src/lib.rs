pub mod cache;
pub mod coverage;
pub mod engine;
pub mod schema;
pub mod snapshot;
pub mod tuple;
