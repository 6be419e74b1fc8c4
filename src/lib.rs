//! Core library of the rehub decision-support engine.
#![warn(missing_docs)]
pub mod building;
pub mod cli;
pub mod clustering;
pub mod decomposition;
pub mod error;
pub mod id;
pub mod infrastructure;
pub mod input;
pub mod kpi;
pub mod log;
pub mod master;
pub mod model;
pub mod output;
pub mod pareto;
pub mod profiles;
pub mod results;
pub mod scenario;
pub mod settings;
pub mod subproblem;
pub mod weather;

#[cfg(test)]
mod fixture;
