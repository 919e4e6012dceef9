//! # Prerender Service
//!
//! Renders client-side web pages in headless Chrome so that crawlers receive
//! fully built markup. Each render runs against a fixed time budget, draws a
//! page from a browser pool without waiting, and settles on one of three
//! outcomes: a fresh render stored in the content cache, a stored render
//! served as a fallback, or a non-cacheable response passed straight through.
//!
//! ## Pipeline
//!
//! | Stage | Module | Notes |
//! |-------|--------|-------|
//! | Budget | [`render_service`] | `timeout - gap - elapsed`, rechecked after acquisition |
//! | Page acquisition | [`browser_pool`] | Shared or isolated-profile browsers, never blocks |
//! | Interception | [`utils`], [`page`] | Stylesheets stubbed, heavy assets aborted |
//! | Navigation + idle wait | [`page`], [`quiescence`] | Network idle, then an idle debounce |
//! | Classification | [`render_service`] | Not-found marker, cacheable status set |
//! | Storage | [`cache`] | Last known good markup per normalized URL |
//! | Transforms | [`minify`], [`optimize`], [`worker`] | Run on dedicated OS threads |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use prerender_service::{Config, Metrics, RenderRequest, RenderService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let service = RenderService::from_config(config, Arc::new(Metrics::new())).await?;
//!
//!     let request = RenderRequest::new("https://example.com", true);
//!     if let Some(outcome) = service.render(request).await {
//!         println!("Rendered {} bytes", outcome.result().html.len());
//!     }
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! prerender render --url https://example.com --output page.html
//! prerender batch --input urls.txt --output rendered/
//! prerender --power-level 3 optimize --input page.html --full
//! ```

/// Configuration and the request/result types
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Tokenized markup and the compressed-or-plain payload type
pub mod markup;

/// Whitespace, comment and attribute minification
pub mod minify;

/// Rule-based markup optimization
pub mod optimize;

/// OS-thread pool running markup transforms
pub mod worker;

/// Browser pages, page leases and the page source seam
pub mod page;

/// Browser pool management for Chrome instances
pub mod browser_pool;

/// Rendered markup store
pub mod cache;

/// Idle-debounce wait after navigation
pub mod quiescence;

/// Render orchestration
pub mod render_service;

/// Command-line interface implementation
pub mod cli;

/// Metrics registration and the Prometheus exporter
pub mod metrics;

/// Request interception policy and helpers
pub mod utils;


pub use browser_pool::*;
pub use cache::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use markup::Markup;
pub use self::metrics::*;
pub use page::*;
pub use quiescence::*;
pub use render_service::*;
pub use utils::*;
pub use worker::*;
