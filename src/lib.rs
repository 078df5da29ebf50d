pub mod config;
pub mod database;
pub mod job;
pub mod notifier;
pub mod ops;
pub mod push;
pub mod queue;
pub mod routes;
pub mod runner;
pub mod sandbox;
pub mod web_server;
pub mod worker;
