//! Comanda API Library
//!
//! Inventory batch-costing and order-fulfillment ledger for a
//! single-restaurant point-of-sale backend. The ledger owns stock batches
//! (FIFO/FEFO consumption), the per-product inventory aggregate
//! (weighted-average costing), and the inventory effects of the order
//! lifecycle. HTTP routing, auth, and reporting live in the consumers of
//! this crate.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod logging;
pub mod migrator;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

pub use errors::{AppError, ServiceError};

use services::batch_store::BatchStoreService;
use services::fulfillment::FulfillmentLedger;
use services::inventory_summary::InventorySummaryService;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub batch_store: BatchStoreService,
    pub inventory_summary: InventorySummaryService,
    pub fulfillment: FulfillmentLedger,
}

impl AppState {
    /// Wires the ledger services over a shared pool. The caller owns the
    /// event receiver side (see `events::process_events`).
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        event_sender: events::EventSender,
    ) -> Self {
        let fulfillment =
            FulfillmentLedger::new(db.clone(), Some(Arc::new(event_sender.clone())));

        Self {
            batch_store: BatchStoreService::new(db.clone()),
            inventory_summary: InventorySummaryService::new(db.clone()),
            fulfillment,
            db,
            config,
            event_sender,
        }
    }
}
