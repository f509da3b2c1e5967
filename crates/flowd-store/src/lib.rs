mod calls;
mod record;
mod store;

pub use store::SqliteStore;
