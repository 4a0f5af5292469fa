use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::db::store::SqliteStore;
use backup_engine::{ObserverSet, Orchestrator};
use std::sync::Arc;

pub struct AppState {
    pub db: DbPool,
    pub store: SqliteStore,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(db: DbPool, config: &AppConfig) -> Self {
        let store = SqliteStore::new(db.clone());
        let orchestrator = Orchestrator::new(
            Arc::new(store.clone()),
            ObserverSet::new(),
            config.engine.clone(),
        );
        Self {
            db,
            store,
            orchestrator,
        }
    }
}
