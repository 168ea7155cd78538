pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod frame;
pub mod genbank;
pub mod header;
pub mod input;
pub mod ncbi;
pub mod output;
pub mod retrieval;
pub mod store;
pub mod translate;
pub mod trim;
