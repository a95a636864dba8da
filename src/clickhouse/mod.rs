// ABOUTME: ClickHouse HTTP interface implementation of the database endpoint
// ABOUTME: Exports connection setup, the endpoint itself and TabSeparated parsing

pub mod connection;
pub mod endpoint;
pub mod tsv;

pub use connection::{connect, connect_with_retry};
pub use endpoint::ClickHouseEndpoint;
