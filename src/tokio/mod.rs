//! Asynchronous PostgreSQL client using Tokio.

mod conn;

pub use conn::Conn;
