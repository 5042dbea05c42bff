//! DWG/DXF to PDF conversion service.
//!
//! A REST job coordinator in front of a broker-backed worker pool. Clients
//! submit conversion jobs, poll their state, cancel them, and inspect queue
//! statistics; workers claim jobs, run the conversion in a killable child
//! process under soft and hard time limits, and store the terminal result.
//!
//! ## Module Overview
//!
//! - `api`: axum router for the five endpoints
//! - `broker`: the `Broker` trait and an in-process implementation
//! - `queue`: Redis-backed `Broker`
//! - `worker`: worker pool (claim loop, slots, time limits, revocation)
//! - `task`: the per-job conversion task
//! - `executor`: execution units running the converter
//! - `converter` / `dxf`: DXF rendering to vector PDF, DWG via `dwg2dxf`
//! - `housekeeping`: stale output cleanup
//! - `config`, `error`, `job`, `telemetry`: shared plumbing
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dwg_converter::{
//!     api::{router, AppState},
//!     broker::{Broker, MemoryBroker},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
//!     let app = router(AppState::new(broker, 100 * 1024 * 1024));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:5000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod converter;
pub mod dxf;
pub mod error;
pub mod executor;
pub mod housekeeping;
pub mod job;
pub mod queue;
pub mod task;
pub mod telemetry;
pub mod worker;
