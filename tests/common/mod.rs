use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

use comanda_api::{
    config::AppConfig,
    db,
    entities::{combo, combo_item, product},
    events::{self, EventSender},
    AppState,
};

/// Harness wiring the ledger services over an in-memory SQLite database.
pub struct TestLedger {
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestLedger {
    /// Construct a fresh ledger with migrated, empty tables.
    pub async fn new() -> Self {
        comanda_api::logging::init_tracing("warn");

        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        cfg.auto_migrate = true;
        // A second pooled connection would see its own empty in-memory
        // database, so the pool is pinned to one.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");

        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(cfg.event_buffer_size);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = AppState::new(db_arc, cfg, event_sender);

        Self {
            state,
            _event_task: event_task,
        }
    }

    pub async fn seed_product(
        &self,
        name: &str,
        price: Decimal,
        cost_price: Option<Decimal>,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            cost_price: Set(cost_price),
            is_menu_item: Set(true),
            category_id: Set(None),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(self.state.db.as_ref())
        .await
        .expect("seed product for tests")
    }

    #[allow(dead_code)]
    pub async fn seed_combo(
        &self,
        name: &str,
        price: Decimal,
        components: &[(Uuid, i32)],
    ) -> combo::Model {
        let now = Utc::now();
        let seeded = combo::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(self.state.db.as_ref())
        .await
        .expect("seed combo for tests");

        for (product_id, quantity) in components {
            combo_item::ActiveModel {
                combo_id: Set(seeded.id),
                product_id: Set(*product_id),
                quantity: Set(*quantity),
                created_at: Set(now),
                ..Default::default()
            }
            .insert(self.state.db.as_ref())
            .await
            .expect("seed combo item for tests");
        }

        seeded
    }
}

impl Drop for TestLedger {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}
