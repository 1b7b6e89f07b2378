use crate::{
    db::DbPool,
    entities::stock_batch::{self, Entity as StockBatchEntity},
    errors::ServiceError,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Request payload for receiving a new stock batch.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReceiveStockRequest {
    pub product_id: Uuid,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub expiry_date: Option<NaiveDate>,
    #[validate(length(max = 255, message = "Supplier cannot exceed 255 characters"))]
    pub supplier: Option<String>,
    #[validate(length(max = 2000, message = "Notes cannot exceed 2000 characters"))]
    pub notes: Option<String>,
}

/// One batch's contribution to a consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionLine {
    pub batch_id: i64,
    pub quantity_taken: Decimal,
    pub unit_cost: Decimal,
}

/// Outcome of walking the batches for a requested quantity.
///
/// `shortfall` is the portion no batch could cover; it is data, not an
/// error — the caller owns the fallback-cost policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Consumption {
    pub lines: Vec<ConsumptionLine>,
    pub shortfall: Decimal,
}

impl Consumption {
    pub fn consumed_quantity(&self) -> Decimal {
        self.lines.iter().map(|l| l.quantity_taken).sum()
    }

    pub fn consumed_cost(&self) -> Decimal {
        self.lines.iter().map(|l| l.quantity_taken * l.unit_cost).sum()
    }
}

/// Consumption order: earliest expiry first (no expiry sorts last), then
/// earliest receipt, then insertion order.
fn consumption_order(a: &stock_batch::Model, b: &stock_batch::Model) -> Ordering {
    match (a.expiry_date, b.expiry_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.received_at.cmp(&b.received_at))
    .then_with(|| a.id.cmp(&b.id))
}

/// Allocates `requested` across `batches`, taking
/// `min(batch remaining, still needed)` from each in the given order.
///
/// Pure over the in-memory sequence; callers persist the per-batch
/// decrements themselves.
pub fn plan_consumption(batches: &[stock_batch::Model], requested: Decimal) -> Consumption {
    let mut remaining = requested;
    let mut lines = Vec::new();

    for batch in batches {
        if remaining <= Decimal::ZERO {
            break;
        }
        if batch.quantity <= Decimal::ZERO {
            continue;
        }

        let taken = batch.quantity.min(remaining);
        lines.push(ConsumptionLine {
            batch_id: batch.id,
            quantity_taken: taken,
            unit_cost: batch.unit_cost,
        });
        remaining -= taken;
    }

    Consumption {
        lines,
        shortfall: remaining.max(Decimal::ZERO),
    }
}

/// Fetches a product's consumable batches (quantity > 0) in consumption
/// order. SQLite and Postgres disagree on NULL ordering, so the nulls-last
/// expiry sort happens here rather than in SQL.
pub(crate) async fn fetch_active<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<Vec<stock_batch::Model>, ServiceError> {
    let mut batches = StockBatchEntity::find()
        .filter(stock_batch::Column::ProductId.eq(product_id))
        .filter(stock_batch::Column::Quantity.gt(Decimal::ZERO))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    batches.sort_by(consumption_order);

    Ok(batches)
}

/// Owns the stock batches of every product: receiving appends lots,
/// consumption drains them oldest-expiry-first.
#[derive(Debug, Clone)]
pub struct BatchStoreService {
    db_pool: Arc<DbPool>,
}

impl BatchStoreService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Appends a received lot for a product.
    ///
    /// Does not touch the inventory record; callers compose both sides of
    /// receiving in one transaction (see `FulfillmentLedger::receive_stock`).
    #[instrument(skip(self, conn, request), fields(product_id = %request.product_id))]
    pub async fn receive<C: ConnectionTrait>(
        &self,
        conn: &C,
        request: &ReceiveStockRequest,
    ) -> Result<i64, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        if request.quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Received quantity must be positive".to_string(),
            ));
        }
        if request.unit_cost <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Unit cost must be positive".to_string(),
            ));
        }
        if let Some(expiry) = request.expiry_date {
            if expiry < Utc::now().date_naive() {
                return Err(ServiceError::ValidationError(
                    "Cannot receive already-expired stock".to_string(),
                ));
            }
        }

        super::find_product(conn, request.product_id).await?;

        let now = Utc::now();
        let batch = stock_batch::ActiveModel {
            product_id: Set(request.product_id),
            quantity: Set(request.quantity),
            original_quantity: Set(request.quantity),
            unit_cost: Set(request.unit_cost),
            expiry_date: Set(request.expiry_date),
            received_at: Set(now),
            supplier: Set(request.supplier.clone()),
            notes: Set(request.notes.clone()),
            created_at: Set(now),
            ..Default::default()
        };

        let inserted = batch.insert(conn).await.map_err(ServiceError::db_error)?;

        info!(
            batch_id = inserted.id,
            quantity = %inserted.quantity,
            unit_cost = %inserted.unit_cost,
            "Stock batch received"
        );

        Ok(inserted.id)
    }

    /// Consumes `quantity` of a product from its batches in consumption
    /// order, decrementing each taken batch in place.
    ///
    /// Never errors on shortfall: a sale must not be blocked by inventory
    /// bookkeeping gaps. The returned breakdown carries what was actually
    /// covered and at what cost.
    #[instrument(skip(self, conn), fields(product_id = %product_id, quantity = %quantity))]
    pub async fn consume<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: Decimal,
    ) -> Result<Consumption, ServiceError> {
        if quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Consumed quantity must be positive".to_string(),
            ));
        }

        let batches = fetch_active(conn, product_id).await?;
        let consumption = plan_consumption(&batches, quantity);

        let by_id: HashMap<i64, &stock_batch::Model> =
            batches.iter().map(|b| (b.id, b)).collect();

        for line in &consumption.lines {
            let model = by_id.get(&line.batch_id).ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "Planned batch {} missing from fetched set",
                    line.batch_id
                ))
            })?;

            let mut active: stock_batch::ActiveModel = (*model).clone().into();
            active.quantity = Set(model.quantity - line.quantity_taken);
            active.update(conn).await.map_err(ServiceError::db_error)?;
        }

        info!(
            consumed = %consumption.consumed_quantity(),
            shortfall = %consumption.shortfall,
            batches = consumption.lines.len(),
            "Stock consumed"
        );

        Ok(consumption)
    }

    /// Read-only view of a product's consumable batches, in the same order
    /// `consume` would drain them.
    pub async fn list_active(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<stock_batch::Model>, ServiceError> {
        fetch_active(self.db_pool.as_ref(), product_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Days, TimeZone};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn batch(
        id: i64,
        quantity: Decimal,
        unit_cost: Decimal,
        expiry_date: Option<NaiveDate>,
        received_offset_days: u64,
    ) -> stock_batch::Model {
        let received_at = Utc
            .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .unwrap()
            .checked_add_days(Days::new(received_offset_days))
            .unwrap();

        stock_batch::Model {
            id,
            product_id: Uuid::nil(),
            quantity,
            original_quantity: quantity,
            unit_cost,
            expiry_date,
            received_at,
            supplier: None,
            notes: None,
            created_at: received_at,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn splits_across_batches_in_expiry_order() {
        let batches = vec![
            batch(1, dec!(5), dec!(10), Some(date(2025, 1, 1)), 0),
            batch(2, dec!(5), dec!(12), Some(date(2025, 2, 1)), 1),
        ];

        let plan = plan_consumption(&batches, dec!(7));

        assert_eq!(plan.shortfall, Decimal::ZERO);
        assert_eq!(
            plan.lines,
            vec![
                ConsumptionLine {
                    batch_id: 1,
                    quantity_taken: dec!(5),
                    unit_cost: dec!(10),
                },
                ConsumptionLine {
                    batch_id: 2,
                    quantity_taken: dec!(2),
                    unit_cost: dec!(12),
                },
            ]
        );
        assert_eq!(plan.consumed_cost(), dec!(74));
    }

    #[test]
    fn earlier_expiry_wins_over_earlier_receipt() {
        let mut batches = vec![
            batch(1, dec!(4), dec!(10), Some(date(2025, 3, 1)), 0),
            batch(2, dec!(4), dec!(11), Some(date(2025, 1, 15)), 5),
        ];
        batches.sort_by(consumption_order);

        let plan = plan_consumption(&batches, dec!(5));

        assert_eq!(plan.lines[0].batch_id, 2);
        assert_eq!(plan.lines[0].quantity_taken, dec!(4));
        assert_eq!(plan.lines[1].batch_id, 1);
        assert_eq!(plan.lines[1].quantity_taken, dec!(1));
    }

    #[test]
    fn batches_without_expiry_sort_last() {
        let mut batches = vec![
            batch(1, dec!(3), dec!(9), None, 0),
            batch(2, dec!(3), dec!(10), Some(date(2025, 6, 1)), 3),
        ];
        batches.sort_by(consumption_order);

        assert_eq!(batches[0].id, 2);
        assert_eq!(batches[1].id, 1);
    }

    #[test]
    fn tie_on_expiry_breaks_on_receipt_then_id() {
        let mut batches = vec![
            batch(7, dec!(1), dec!(1), Some(date(2025, 5, 1)), 2),
            batch(3, dec!(1), dec!(1), Some(date(2025, 5, 1)), 2),
            batch(5, dec!(1), dec!(1), Some(date(2025, 5, 1)), 1),
        ];
        batches.sort_by(consumption_order);

        let ids: Vec<i64> = batches.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![5, 3, 7]);
    }

    #[test]
    fn shortfall_drains_everything_available() {
        let batches = vec![
            batch(1, dec!(5), dec!(10), Some(date(2025, 1, 1)), 0),
            batch(2, dec!(3), dec!(12), Some(date(2025, 2, 1)), 1),
        ];

        let plan = plan_consumption(&batches, dec!(20));

        assert_eq!(plan.shortfall, dec!(12));
        assert_eq!(plan.consumed_quantity(), dec!(8));
        for (line, batch) in plan.lines.iter().zip(&batches) {
            assert_eq!(line.quantity_taken, batch.quantity);
        }
    }

    #[test]
    fn exact_consume_of_single_receipt() {
        let batches = vec![batch(1, dec!(9), dec!(4.5), None, 0)];

        let plan = plan_consumption(&batches, dec!(9));

        assert_eq!(plan.shortfall, Decimal::ZERO);
        assert_eq!(plan.lines.len(), 1);
        assert_eq!(plan.lines[0].quantity_taken, dec!(9));
        assert_eq!(plan.lines[0].unit_cost, dec!(4.5));
    }

    #[test]
    fn zero_quantity_batches_are_skipped() {
        let batches = vec![
            batch(1, Decimal::ZERO, dec!(10), Some(date(2025, 1, 1)), 0),
            batch(2, dec!(4), dec!(12), Some(date(2025, 2, 1)), 1),
        ];

        let plan = plan_consumption(&batches, dec!(2));

        assert_eq!(plan.lines.len(), 1);
        assert_eq!(plan.lines[0].batch_id, 2);
    }

    proptest! {
        #[test]
        fn allocation_conserves_quantity(
            quantities in proptest::collection::vec(0u32..500, 0..8),
            requested in 1u32..2000,
        ) {
            let batches: Vec<stock_batch::Model> = quantities
                .iter()
                .enumerate()
                .map(|(i, q)| batch(i as i64 + 1, Decimal::from(*q), dec!(2.5), None, i as u64))
                .collect();
            let requested = Decimal::from(requested);

            let plan = plan_consumption(&batches, requested);

            let total: Decimal = batches.iter().map(|b| b.quantity).sum();
            prop_assert_eq!(plan.consumed_quantity() + plan.shortfall, requested);
            prop_assert_eq!(plan.shortfall, (requested - total).max(Decimal::ZERO));

            for line in &plan.lines {
                let source = batches.iter().find(|b| b.id == line.batch_id).unwrap();
                prop_assert!(line.quantity_taken > Decimal::ZERO);
                prop_assert!(line.quantity_taken <= source.quantity);
            }
        }
    }
}
