//! Benchmark harness: starts or attaches to a service, drives concurrent load
//! against it, samples metrics on a fixed cadence and grades the aggregated
//! results against declared targets.

pub mod aggregate;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod loadgen;
pub mod orchestrator;
pub mod process;
pub mod report;
pub mod sampler;
pub mod types;
