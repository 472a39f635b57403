//! Build-time blame: per-project build step timing history and step-level
//! attribution of build time changes.

pub mod auth;
pub mod blame;
pub mod cli;
pub mod collector;
pub mod error;
pub mod history;
pub mod logparse;
pub mod models;
pub mod providers;
