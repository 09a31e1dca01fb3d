//! Embedded persistence layer
//!
//! One SQLite database in WAL mode shared by the engine (call history
//! writes), the outbound worker (campaign tables) and the admin surface
//! (reads). Transactions stay short and never span network I/O; leasing
//! uses `BEGIN IMMEDIATE` select-then-update so it needs nothing beyond
//! baseline SQL.

pub mod call_history;
pub mod outbound;
pub mod setup;

pub use call_history::{CallHistoryStore, CallRecordSummary, HistoryFilter, HistoryPage};
pub use outbound::{
    AmdStatus, Attempt, Campaign, CampaignState, Lead, LeadState, NewCampaign, NewLead,
    OutboundStore,
};
pub use setup::{open_database, open_test_database};

use sqlx::SqlitePool;

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// All stores over one shared pool.
#[derive(Clone)]
pub struct PersistenceLayer {
    pub call_history: CallHistoryStore,
    pub outbound: OutboundStore,
}

impl PersistenceLayer {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            call_history: CallHistoryStore::new(pool.clone()),
            outbound: OutboundStore::new(pool),
        }
    }
}

/// Open the database and build the stores.
pub async fn init(database_path: &str) -> Result<PersistenceLayer, PersistenceError> {
    let pool = open_database(std::path::Path::new(database_path)).await?;
    Ok(PersistenceLayer::new(pool))
}
