pub mod aggregator;
pub mod config;
pub mod db;
pub mod enrichment;
pub mod errors;
pub mod grid;
pub mod pacing;
pub mod places;
pub mod processor;
pub mod restaurants;
pub mod routes;
pub mod stats;
pub mod work_items;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::AppConfig;
pub use errors::{AppError, AppResult};
pub use routes::{router, AppState};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,places_grid_collector=debug,tower_http=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
