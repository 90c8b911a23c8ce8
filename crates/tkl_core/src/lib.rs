pub mod cards;
pub mod chunking;
pub mod db;
pub mod domain;
pub mod error;
pub mod hash;
pub mod ingest;
pub mod normalize;
pub mod report;
pub mod store;
