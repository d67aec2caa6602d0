//! GoBingo intake: conversational document collection for vehicle
//! insurance referrals.
//!
//! A chat bot walks a user through photographing their identity card,
//! driver's license, and vehicle log card, then collects referral details
//! as free text. Each photo goes through a vision-language model (with an
//! OCR fallback for identity cards), the extracted fields are merged into
//! one record, and the record is filed as an item on a CRM board.
//!
//! Layering, bottom up:
//! - [`pipeline`] — image ingest, preprocessing, model runtime, per-kind
//!   extraction strategies, field parsing
//! - [`session`] — per-user conversation state machine
//! - [`aggregate`] / [`gateway`] — record merging and board delivery
//! - [`controller`] — turns chat events into replies and transitions

pub mod aggregate;
pub mod config;
pub mod controller;
pub mod gateway;
pub mod pipeline;
pub mod session;

use tracing_subscriber::EnvFilter;

pub use controller::IntakeController;
pub use session::{DocumentKind, FieldMap, Stage};

/// Initialize tracing from `RUST_LOG`, defaulting to `info` for this crate.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gobingo_intake=info,warn")),
        )
        .init();

    tracing::info!("GoBingo intake v{}", config::APP_VERSION);
}
