//! Admin API handlers

pub mod analytics;
pub mod apps;
pub mod auth;
pub mod mcp;
pub mod net_admin;
pub mod sql;
pub mod system;
