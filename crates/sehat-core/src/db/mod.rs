//! Database layer for Sehat

mod connection;
mod migrations;

pub use connection::Database;
