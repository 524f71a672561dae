pub mod sqlite;

// Re-export the store implementation for convenience
pub use sqlite::SqliteTokenStore;
