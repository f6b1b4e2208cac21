// Persistence layer: embedded SQLite schema and query helpers.

pub mod sqlite;

pub use sqlite::{Database, DbPool};
