//! Epidash - an epidemic statistics dashboard backend.
//!
//! # Overview
//!
//! Epidash polls public epidemic-statistics APIs, reconciles the region
//! names they use with the names of a map's boundary polygons, and prepares
//! four products for display:
//!
//! - a daily national trend series with day-over-day deltas
//! - headline counters
//! - province- and city-level choropleth tables
//! - a time-lapse of province counts bucketed into frames
//!
//! Raw upstream documents are archived as dated JSON files, and the
//! per-province history is accumulated in SQLite so the time-lapse can span
//! more than upstream keeps.
//!
//! # Modules
//!
//! - [`model`]: Counts, records, bands, series and tables
//! - [`normalize`]: Region name normalization
//! - [`boundary`]: Canonical region names from GeoJSON boundary data
//! - [`data_sources`]: Upstream endpoints, record schemas and the fetcher
//! - [`aggregation`]: Daily series and region tables
//! - [`temporal`]: Time-bucketed snapshot index
//! - [`table_cache`]: Persisted region tables
//! - [`storage`]: SQLite storage layer
//! - [`render`]: Chart, map and frame descriptions; video encoding
//! - [`dashboard`]: Refresh cycle and last known-good fallback
//! - [`config`]: Environment configuration
//! - [`api`]: HTTP API handlers

pub mod aggregation;
pub mod api;
pub mod boundary;
pub mod config;
pub mod dashboard;
pub mod data_sources;
pub mod error;
pub mod model;
pub mod normalize;
pub mod render;
pub mod storage;
pub mod table_cache;
pub mod temporal;
