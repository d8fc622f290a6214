//! Integration tests

mod broker_tests;
mod common;
mod dispatcher_tests;
mod gateway_tests;
