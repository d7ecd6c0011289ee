//! Routegate - a reverse proxy that manages the lifecycle of its routes
//!
//! This library provides a route engine that:
//! - Discovers routes from TOML files and Docker container labels, local or
//!   behind a remote agent
//! - Reconciles the live route set whenever a source changes
//! - Routes HTTP traffic by Host header and relays raw TCP/UDP streams
//! - Health-checks every route over HTTP, TCP/UDP or a remote agent
//! - Stops idle containers and wakes them on the next request
//! - Shuts everything down in order through a task tree

pub mod admin;
pub mod agent;
pub mod agent_provider;
pub mod config;
pub mod control;
pub mod docker;
pub mod docker_provider;
pub mod error;
pub mod events;
pub mod file_provider;
pub mod health;
pub mod idlewatcher;
pub mod pool;
pub mod probe;
pub mod provider;
pub mod proxy;
pub mod registry;
pub mod route;
pub mod stream;
pub mod task;
