use thiserror::Error;

use crate::types::Intent;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Baseline feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pricing(#[from] PricingError),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Per-item pricing failures. Contained to the item being priced; a pricing
/// cycle logs these and moves on to the next item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error("not enough {side} listings")]
    InsufficientListings { side: Intent },

    #[error("not enough listings left after outlier filtering")]
    NotEnoughAfterFiltering,

    #[error("no baseline quote available")]
    BaselineUnavailable,

    #[error("baseline quote is zero-priced on both sides")]
    BaselineZeroPrice,

    #[error("derived price diverges too far from baseline: {0}")]
    DivergenceRejected(String),

    #[error("price swing exceeds limit: {0}")]
    SwingRejected(String),

    #[error("malformed or zero-priced item skipped")]
    MalformedItemSkipped,

    #[error("item name does not resolve to a SKU")]
    SkuUnresolvable,
}
