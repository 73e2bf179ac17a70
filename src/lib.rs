//
// lib.rs
// Dicom-Intake-rs
//
// Exposes the crate's modules and re-exports the CLI entry point for both binary and library consumers.
//
// Thales Matheus Mendonça Santos - November 2025

// Pipeline stages, leaf first.
pub mod validate;
pub mod convert;
pub mod anonymize;
pub mod seal;
pub mod persist;

// State, execution and queries.
pub mod audit;
pub mod db;
pub mod dispatch;
pub mod job;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod status;
pub mod storage;
pub mod tracker;

// Ingress and operator surfaces.
pub mod batch;
pub mod cli;
pub mod config;
pub mod preview;
pub mod service;
pub mod web;

pub use cli::{run as run_cli, Cli, Commands};
pub use config::Config;
pub use service::IntakeService;
