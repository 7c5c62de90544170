//! Courtside POS - checkout, split billing, and cash reconciliation for a
//! sports-club front desk.
//!
//! The engine turns a court reservation or walk-in sale into a checkout
//! with one or more payer accounts, splits the bill across them, takes
//! cash and QR payment-request payments, and reconciles every cash
//! movement against a shift-scoped ledger. State lives in a local SQLite
//! database; callers embed the crate and drive it through the
//! module-level operations, each of which runs as one transaction.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod checkout;
pub mod db;
pub mod error;
pub mod ledger;
pub mod money;
pub mod payments;
pub mod shifts;
pub mod spayd;
pub mod split;

pub use db::DbState;
pub use error::{EngineError, EngineResult};
pub use money::Money;

/// Initialize structured logging: console always, plus a daily rolling
/// file when `log_dir` is given. `RUST_LOG` overrides the default filter.
///
/// Call once at process start. The file writer's flush guard is leaked
/// deliberately so logs keep flushing until process exit.
pub fn init_logging(log_dir: Option<&std::path::Path>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,courtside_pos=debug"));

    let console_layer = fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::daily(dir, "courtside");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            registry.with(file_layer).init();
            std::mem::forget(guard);
        }
        None => registry.init(),
    }

    info!("Courtside POS engine v{}", env!("CARGO_PKG_VERSION"));
}
