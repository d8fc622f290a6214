//! Broker connection and tunnel stream dispatch

mod connection;

pub use connection::EdgeAgent;
