//! Shared data model for planfold: dependency sets, context values, plan
//! nodes, layout fragments, the per-batch wire contract, and resolver
//! configuration.

pub mod config;
pub mod models;
