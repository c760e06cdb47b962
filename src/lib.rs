// ABOUTME: Library root for crm-sync
// ABOUTME: Exposes the sync engine modules for the CLI binary and integration tests

pub mod checkpoint;
pub mod config;
pub mod crm;
pub mod db;
pub mod governor;
pub mod mapper;
pub mod orchestrator;
pub mod scheduler;
pub mod sink;
pub mod statedir;
