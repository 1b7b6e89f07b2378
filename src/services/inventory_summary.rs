use crate::{
    db::DbPool,
    entities::inventory_record::{self, Entity as InventoryRecordEntity},
    errors::ServiceError,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Before/after capture of an absolute quantity override, returned to the
/// caller for reporting; not persisted as a ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantityChange {
    pub previous: Decimal,
    pub current: Decimal,
    pub delta: Decimal,
}

/// Weighted moving average after receiving `quantity` at `unit_cost`.
fn weighted_average(
    old_quantity: Decimal,
    old_avg: Decimal,
    quantity: Decimal,
    unit_cost: Decimal,
) -> Decimal {
    let total = old_quantity + quantity;
    if total > Decimal::ZERO {
        (old_quantity * old_avg + quantity * unit_cost) / total
    } else {
        unit_cost
    }
}

/// Owns the single denormalized aggregate row per product.
///
/// The aggregate is a reporting convenience, deliberately allowed to drift
/// from the batch level: it may go negative on oversell, and cancellation
/// restores it without touching batches. The batches stay the source of
/// truth for sale-time costing.
#[derive(Debug, Clone)]
pub struct InventorySummaryService {
    db_pool: Arc<DbPool>,
}

impl InventorySummaryService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Fetches the aggregate row for a product, if any.
    pub async fn get_record(
        &self,
        product_id: Uuid,
    ) -> Result<Option<inventory_record::Model>, ServiceError> {
        self.find_record(self.db_pool.as_ref(), product_id).await
    }

    /// Transaction-aware variant of [`get_record`](Self::get_record).
    pub async fn find_record<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
    ) -> Result<Option<inventory_record::Model>, ServiceError> {
        InventoryRecordEntity::find()
            .filter(inventory_record::Column::ProductId.eq(product_id))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Folds a receipt into the aggregate: first receipt creates the row,
    /// later receipts recompute the weighted average.
    #[instrument(skip(self, conn), fields(product_id = %product_id, quantity = %quantity))]
    pub async fn apply_receive<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: Decimal,
        unit_cost: Decimal,
        category_id: Option<Uuid>,
    ) -> Result<inventory_record::Model, ServiceError> {
        if quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Received quantity must be positive".to_string(),
            ));
        }

        let now = Utc::now();

        match self.find_record(conn, product_id).await? {
            Some(record) => {
                let new_avg =
                    weighted_average(record.quantity, record.avg_cost, quantity, unit_cost);

                let mut active: inventory_record::ActiveModel = record.clone().into();
                active.quantity = Set(record.quantity + quantity);
                active.avg_cost = Set(new_avg);
                if category_id.is_some() {
                    active.category_id = Set(category_id);
                }
                active.updated_at = Set(now);

                active.update(conn).await.map_err(ServiceError::db_error)
            }
            None => {
                let record = inventory_record::ActiveModel {
                    product_id: Set(product_id),
                    quantity: Set(quantity),
                    avg_cost: Set(unit_cost),
                    min_quantity: Set(Decimal::ZERO),
                    category_id: Set(category_id),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };

                info!(%product_id, "Creating inventory record on first receipt");

                record.insert(conn).await.map_err(ServiceError::db_error)
            }
        }
    }

    /// Decrements the aggregate quantity (negative `quantity` restores).
    ///
    /// The quantity is allowed to go negative: sales never fail because the
    /// tracked stock has drifted. The average cost is untouched.
    #[instrument(skip(self, conn), fields(product_id = %product_id, quantity = %quantity))]
    pub async fn apply_consume<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: Decimal,
    ) -> Result<inventory_record::Model, ServiceError> {
        if quantity == Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Consumed quantity must not be zero".to_string(),
            ));
        }

        let now = Utc::now();

        match self.find_record(conn, product_id).await? {
            Some(record) => {
                let mut active: inventory_record::ActiveModel = record.clone().into();
                active.quantity = Set(record.quantity - quantity);
                active.updated_at = Set(now);

                active.update(conn).await.map_err(ServiceError::db_error)
            }
            None => {
                // The aggregate must absorb the full deduction even when the
                // product was never received; the zero average defers costing
                // to the product's own cost price.
                let record = inventory_record::ActiveModel {
                    product_id: Set(product_id),
                    quantity: Set(-quantity),
                    avg_cost: Set(Decimal::ZERO),
                    min_quantity: Set(Decimal::ZERO),
                    category_id: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };

                record.insert(conn).await.map_err(ServiceError::db_error)
            }
        }
    }

    /// Absolute override for manual correction. Returns the before/after
    /// delta for the caller to report.
    #[instrument(skip(self, conn), fields(product_id = %product_id, new_quantity = %new_quantity))]
    pub async fn set_quantity<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        new_quantity: Decimal,
    ) -> Result<QuantityChange, ServiceError> {
        if new_quantity < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Quantity override must not be negative".to_string(),
            ));
        }

        let now = Utc::now();

        match self.find_record(conn, product_id).await? {
            Some(record) => {
                let previous = record.quantity;

                let mut active: inventory_record::ActiveModel = record.into();
                active.quantity = Set(new_quantity);
                active.updated_at = Set(now);
                active.update(conn).await.map_err(ServiceError::db_error)?;

                Ok(QuantityChange {
                    previous,
                    current: new_quantity,
                    delta: new_quantity - previous,
                })
            }
            None => {
                // Correcting a never-received product is a legitimate flow;
                // seed the average from the catalog cost.
                let product = super::find_product(conn, product_id).await?;

                let record = inventory_record::ActiveModel {
                    product_id: Set(product_id),
                    quantity: Set(new_quantity),
                    avg_cost: Set(product.cost_price.unwrap_or(Decimal::ZERO)),
                    min_quantity: Set(Decimal::ZERO),
                    category_id: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };
                record.insert(conn).await.map_err(ServiceError::db_error)?;

                Ok(QuantityChange {
                    previous: Decimal::ZERO,
                    current: new_quantity,
                    delta: new_quantity,
                })
            }
        }
    }

    /// Metadata-only category update.
    pub async fn set_category<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        category_id: Option<Uuid>,
    ) -> Result<inventory_record::Model, ServiceError> {
        let record = self
            .find_record(conn, product_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No inventory record for product {}", product_id))
            })?;

        let mut active: inventory_record::ActiveModel = record.into();
        active.category_id = Set(category_id);
        active.updated_at = Set(Utc::now());

        active.update(conn).await.map_err(ServiceError::db_error)
    }

    /// Updates the reorder threshold used for low-stock signals.
    pub async fn set_reorder_threshold<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        min_quantity: Decimal,
    ) -> Result<inventory_record::Model, ServiceError> {
        if min_quantity < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Reorder threshold must not be negative".to_string(),
            ));
        }

        let record = self
            .find_record(conn, product_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No inventory record for product {}", product_id))
            })?;

        let mut active: inventory_record::ActiveModel = record.into();
        active.min_quantity = Set(min_quantity);
        active.updated_at = Set(Utc::now());

        active.update(conn).await.map_err(ServiceError::db_error)
    }
}
