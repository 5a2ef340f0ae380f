//! Searcherr: stalled-download cleanup and throttled missing-media search
//! for Radarr and Sonarr.

pub mod api;
pub mod app;
pub mod config;
pub mod jobs;
pub mod services;
