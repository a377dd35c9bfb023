//! Refresh-token storage backends

mod memory;
mod postgres;

pub use memory::InMemoryTokenStore;
pub use postgres::PgTokenStore;
