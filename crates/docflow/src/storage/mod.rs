//! Durable storage for jobs, documents, chunks, and staged uploads

mod database;

pub use database::IngestDb;
