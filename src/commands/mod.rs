pub mod embed;
pub mod evaluate;
pub mod ingest;
pub mod search;
pub mod sql;
pub mod status;
