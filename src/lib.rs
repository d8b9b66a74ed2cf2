//! Plant disease classification service.
//!
//! A pretrained Vision Transformer ranks an uploaded leaf image against a fixed
//! disease taxonomy; the top label is then sent to a generative text API for
//! severity, treatment and prevention advice.

pub mod classes;
pub mod error;
pub mod gemini;
pub mod model;
pub mod preprocess;
pub mod server;
pub mod utils;
pub mod vit;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub use server::{create_router, run_server, AppState};

/// Initialize logging
pub fn init_logging(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Global tracing subscriber already set");
    }
}
