pub mod agent;
pub mod btle;
pub mod connection;
pub mod constants;
pub mod deadline;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod types;
pub mod write_verify;
