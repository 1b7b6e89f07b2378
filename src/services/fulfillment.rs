use crate::{
    db::{DatabaseAccess, DbPool},
    entities::{
        combo_item::{self, Entity as ComboItemEntity},
        combo::Entity as ComboEntity,
        inventory_record,
        order::{self, ActiveModel as OrderActiveModel, Entity as OrderEntity},
        order_item::{self, Entity as OrderItemEntity},
        product,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        batch_store::{self, BatchStoreService, Consumption, ReceiveStockRequest},
        inventory_summary::{InventorySummaryService, QuantityChange},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Order lifecycle states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
}

/// Inventory side effect of a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryEffect {
    None,
    ReverseInventory,
}

/// Transition table evaluated before any status write.
///
/// Stock is deducted when the order is created, so moves among the
/// non-cancelled states carry no effect; only the move into `cancelled`
/// reverses, and it can fire at most once because `cancelled` is terminal.
pub fn transition_effect(
    from: OrderStatus,
    to: OrderStatus,
) -> Result<InventoryEffect, ServiceError> {
    match (from, to) {
        (OrderStatus::Cancelled, _) => Err(ServiceError::InvalidOperation(
            "Cancelled orders cannot change status".to_string(),
        )),
        (_, OrderStatus::Cancelled) => Ok(InventoryEffect::ReverseInventory),
        _ => Ok(InventoryEffect::None),
    }
}

/// One sold unit of a product or combo within an order request.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LineItemRequest {
    pub product_id: Option<Uuid>,
    pub combo_id: Option<Uuid>,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    pub unit_price: Decimal,
    pub variation_id: Option<Uuid>,
    #[serde(default)]
    pub is_spicy: bool,
    #[validate(length(max = 500, message = "Notes cannot exceed 500 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FulfillOrderRequest {
    #[validate(length(
        min = 1,
        max = 50,
        message = "Order number must be between 1 and 50 characters"
    ))]
    pub order_number: String,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "An order needs at least one line item"))]
    pub line_items: Vec<LineItemRequest>,
}

/// A persisted line item together with its sale-time cost breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct CostedLine {
    pub line_item: order_item::Model,
    pub unit_cost_price: Decimal,
    pub shortfall: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct FulfillmentResult {
    pub order: order::Model,
    pub lines: Vec<CostedLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiveStockResult {
    pub batch_id: i64,
    pub record: inventory_record::Model,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeductResult {
    pub consumption: Consumption,
    pub change: QuantityChange,
}

/// Cost assigned to shortfall quantity: summary average, then the product's
/// own cost price, then zero. A line item always ends up with a cost.
async fn fallback_unit_cost<C: ConnectionTrait>(
    conn: &C,
    summary: &InventorySummaryService,
    product: &product::Model,
) -> Result<Decimal, ServiceError> {
    if let Some(record) = summary.find_record(conn, product.id).await? {
        return Ok(record.avg_cost);
    }
    Ok(product.cost_price.unwrap_or(Decimal::ZERO))
}

/// Orchestrates the inventory effects of the order lifecycle: fulfillment
/// at creation, reversal at cancellation, plus the composed receiving and
/// manual adjustment paths. Every public operation is one transaction.
#[derive(Clone)]
pub struct FulfillmentLedger {
    db: DatabaseAccess,
    batch_store: BatchStoreService,
    summary: InventorySummaryService,
    event_sender: Option<Arc<EventSender>>,
}

impl FulfillmentLedger {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db: DatabaseAccess::new(db_pool.clone()),
            batch_store: BatchStoreService::new(db_pool.clone()),
            summary: InventorySummaryService::new(db_pool),
            event_sender,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(event_sender) = &self.event_sender {
            if let Err(e) = event_sender.send(event).await {
                warn!(error = %e, "Failed to send ledger event");
            }
        }
    }

    /// Creates an order and applies its inventory effects as one unit of
    /// work: either every line item is costed, persisted, and deducted, or
    /// nothing is.
    ///
    /// This path never fails on stock levels; shortfalls are costed through
    /// the fallback chain and the aggregate may run negative.
    #[instrument(skip(self, request), fields(order_number = %request.order_number))]
    pub async fn fulfill_order(
        &self,
        request: FulfillOrderRequest,
    ) -> Result<FulfillmentResult, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        for item in &request.line_items {
            item.validate()
                .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

            match (item.product_id, item.combo_id) {
                (Some(_), Some(_)) | (None, None) => {
                    return Err(ServiceError::ValidationError(
                        "A line item must reference exactly one of product or combo".to_string(),
                    ));
                }
                _ => {}
            }
        }

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let total_amount: Decimal = request
            .line_items
            .iter()
            .map(|item| item.unit_price * Decimal::from(item.quantity))
            .sum();

        let batch_store = self.batch_store.clone();
        let summary = self.summary.clone();
        let req = request;

        let (result, warnings) = self
            .db
            .transaction::<_, (FulfillmentResult, Vec<Event>), ServiceError>(move |txn| {
                Box::pin(async move {
                    let order_model = OrderActiveModel {
                        id: Set(order_id),
                        order_number: Set(req.order_number.clone()),
                        status: Set(OrderStatus::Pending.to_string()),
                        order_date: Set(now),
                        total_amount: Set(total_amount),
                        notes: Set(req.notes.clone()),
                        created_at: Set(now),
                        updated_at: Set(Some(now)),
                        version: Set(1),
                    }
                    .insert(txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                    let mut lines = Vec::with_capacity(req.line_items.len());
                    let mut warnings = Vec::new();

                    for item in &req.line_items {
                        let quantity = Decimal::from(item.quantity);

                        let (name, unit_cost_price, shortfall) =
                            match (item.product_id, item.combo_id) {
                                (Some(product_id), None) => {
                                    let product = super::find_product(txn, product_id).await?;

                                    let consumption =
                                        batch_store.consume(txn, product_id, quantity).await?;

                                    let mut total_cost = consumption.consumed_cost();
                                    if consumption.shortfall > Decimal::ZERO {
                                        let unit =
                                            fallback_unit_cost(txn, &summary, &product).await?;
                                        total_cost += consumption.shortfall * unit;
                                    }
                                    let unit_cost_price = total_cost / quantity;

                                    // Even the shortfall portion is deducted;
                                    // the aggregate absorbs the drift.
                                    let record =
                                        summary.apply_consume(txn, product_id, quantity).await?;
                                    if record.quantity <= record.min_quantity {
                                        warnings.push(Event::LowStock {
                                            product_id,
                                            quantity: record.quantity,
                                            min_quantity: record.min_quantity,
                                        });
                                    }

                                    (product.name, unit_cost_price, consumption.shortfall)
                                }
                                (None, Some(combo_id)) => {
                                    let combo = ComboEntity::find_by_id(combo_id)
                                        .one(txn)
                                        .await
                                        .map_err(ServiceError::db_error)?
                                        .ok_or_else(|| {
                                            ServiceError::NotFound(format!(
                                                "Combo {} not found",
                                                combo_id
                                            ))
                                        })?;

                                    let components = ComboItemEntity::find()
                                        .filter(combo_item::Column::ComboId.eq(combo_id))
                                        .all(txn)
                                        .await
                                        .map_err(ServiceError::db_error)?;

                                    // Combos are costed from the catalog; they
                                    // never touch batches or the aggregate.
                                    let mut unit_cost = Decimal::ZERO;
                                    for component in &components {
                                        let product =
                                            super::find_product(txn, component.product_id).await?;
                                        unit_cost += Decimal::from(component.quantity)
                                            * product.cost_price.unwrap_or(Decimal::ZERO);
                                    }

                                    (combo.name, unit_cost, Decimal::ZERO)
                                }
                                _ => {
                                    return Err(ServiceError::ValidationError(
                                        "A line item must reference exactly one of product or combo"
                                            .to_string(),
                                    ));
                                }
                            };

                        let line = order_item::ActiveModel {
                            id: Set(Uuid::new_v4()),
                            order_id: Set(order_id),
                            product_id: Set(item.product_id),
                            combo_id: Set(item.combo_id),
                            name: Set(name),
                            quantity: Set(item.quantity),
                            unit_price: Set(item.unit_price),
                            unit_cost_price: Set(unit_cost_price),
                            variation_id: Set(item.variation_id),
                            is_spicy: Set(item.is_spicy),
                            notes: Set(item.notes.clone()),
                            ..Default::default()
                        }
                        .insert(txn)
                        .await
                        .map_err(ServiceError::db_error)?;

                        lines.push(CostedLine {
                            line_item: line,
                            unit_cost_price,
                            shortfall,
                        });
                    }

                    Ok((
                        FulfillmentResult {
                            order: order_model,
                            lines,
                        },
                        warnings,
                    ))
                })
            })
            .await?;

        info!(
            order_id = %order_id,
            line_count = result.lines.len(),
            total_amount = %total_amount,
            "Order fulfilled"
        );

        self.emit(Event::OrderCreated(order_id)).await;
        for event in warnings {
            self.emit(event).await;
        }

        Ok(result)
    }

    /// Moves an order to a new status, applying the transition table's
    /// inventory effect inside the same transaction.
    ///
    /// Reversal restores only the aggregate; consumed batch quantities stay
    /// as they are. Restoring them would recompute average costs and change
    /// the reports downstream.
    #[instrument(skip(self, notes), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        notes: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let db = self.db.get_pool();
        let now = Utc::now();

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to start transaction for status update");
            ServiceError::DatabaseError(e)
        })?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                warn!(order_id = %order_id, "Order not found for status update");
                ServiceError::NotFound("Order not found".to_string())
            })?;

        let old_status = OrderStatus::from_str(&order.status).map_err(|_| {
            ServiceError::InternalError(format!(
                "Order {} carries unknown status {}",
                order_id, order.status
            ))
        })?;

        let effect = transition_effect(old_status, new_status)?;

        if effect == InventoryEffect::ReverseInventory {
            let items = OrderItemEntity::find()
                .filter(order_item::Column::OrderId.eq(order_id))
                .all(&txn)
                .await
                .map_err(ServiceError::db_error)?;

            for item in items {
                if let Some(product_id) = item.product_id {
                    self.summary
                        .apply_consume(&txn, product_id, -Decimal::from(item.quantity))
                        .await?;
                }
            }
        }

        let old_status_str = order.status.clone();
        let version = order.version;

        let mut active: OrderActiveModel = order.into();
        active.status = Set(new_status.to_string());
        active.updated_at = Set(Some(now));
        active.version = Set(version + 1);
        if let Some(notes) = notes {
            active.notes = Set(Some(notes));
        }

        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit status update transaction");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            order_id = %order_id,
            old_status = %old_status_str,
            new_status = %new_status,
            "Order status updated"
        );

        self.emit(Event::OrderStatusChanged {
            order_id,
            old_status: old_status_str,
            new_status: new_status.to_string(),
        })
        .await;

        if new_status == OrderStatus::Cancelled {
            self.emit(Event::OrderCancelled(order_id)).await;
        }

        Ok(updated)
    }

    /// Cancels an order (refund path included: completed orders can still
    /// cancel). The aggregate inventory effect reverses exactly once.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        self.update_order_status(order_id, OrderStatus::Cancelled, reason)
            .await
    }

    /// Composed receiving path: appends the batch and folds the receipt into
    /// the aggregate in one transaction.
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn receive_stock(
        &self,
        request: ReceiveStockRequest,
    ) -> Result<ReceiveStockResult, ServiceError> {
        let db = self.db.get_pool();

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for stock receipt");
            ServiceError::DatabaseError(e)
        })?;

        let batch_id = self.batch_store.receive(&txn, &request).await?;
        let record = self
            .summary
            .apply_receive(
                &txn,
                request.product_id,
                request.quantity,
                request.unit_cost,
                None,
            )
            .await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit stock receipt transaction");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            product_id = %request.product_id,
            batch_id,
            quantity = %request.quantity,
            "Stock received"
        );

        self.emit(Event::StockReceived {
            product_id: request.product_id,
            batch_id,
            quantity: request.quantity,
            unit_cost: request.unit_cost,
        })
        .await;

        Ok(ReceiveStockResult { batch_id, record })
    }

    /// Manual correction of the aggregate by a signed delta; batches are not
    /// touched (loss/damage where batch attribution is not tracked).
    #[instrument(skip(self, reason), fields(product_id = %product_id, delta = %delta))]
    pub async fn manual_adjust(
        &self,
        product_id: Uuid,
        delta: Decimal,
        reason: &str,
    ) -> Result<QuantityChange, ServiceError> {
        let db = self.db.get_pool();

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for manual adjustment");
            ServiceError::DatabaseError(e)
        })?;

        let previous = self
            .summary
            .find_record(&txn, product_id)
            .await?
            .map(|r| r.quantity)
            .unwrap_or(Decimal::ZERO);

        let target = previous + delta;
        if target < Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "Adjustment would drive quantity below zero (current {}, delta {})",
                previous, delta
            )));
        }

        let change = self.summary.set_quantity(&txn, product_id, target).await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit manual adjustment transaction");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            product_id = %product_id,
            previous = %change.previous,
            current = %change.current,
            reason,
            "Inventory adjusted"
        );

        self.emit(Event::InventoryAdjusted {
            product_id,
            old_quantity: change.previous,
            new_quantity: change.current,
            reason: reason.to_string(),
        })
        .await;

        Ok(change)
    }

    /// Batch-aware manual deduction. Unlike order fulfillment this path is
    /// not allowed to oversell: when batches or the aggregate cannot cover
    /// the request the whole transaction fails with `InsufficientStock` and
    /// nothing is mutated.
    #[instrument(skip(self, reason), fields(product_id = %product_id, quantity = %quantity))]
    pub async fn deduct(
        &self,
        product_id: Uuid,
        quantity: Decimal,
        reason: &str,
    ) -> Result<DeductResult, ServiceError> {
        if quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Deducted quantity must be positive".to_string(),
            ));
        }

        let batch_store = self.batch_store.clone();
        let summary = self.summary.clone();

        let (result, warning) = self
            .db
            .transaction::<_, (DeductResult, Option<Event>), ServiceError>(move |txn| {
                Box::pin(async move {
                    super::find_product(txn, product_id).await?;

                    let batches = batch_store::fetch_active(txn, product_id).await?;
                    let available: Decimal = batches.iter().map(|b| b.quantity).sum();
                    if available < quantity {
                        return Err(ServiceError::InsufficientStock(format!(
                            "Requested {} but only {} available in batches",
                            quantity, available
                        )));
                    }

                    let previous = summary
                        .find_record(txn, product_id)
                        .await?
                        .map(|r| r.quantity)
                        .unwrap_or(Decimal::ZERO);
                    if previous < quantity {
                        return Err(ServiceError::InsufficientStock(format!(
                            "Requested {} but inventory record holds {}",
                            quantity, previous
                        )));
                    }

                    let consumption = batch_store.consume(txn, product_id, quantity).await?;
                    let record = summary.apply_consume(txn, product_id, quantity).await?;

                    let warning = (record.quantity <= record.min_quantity).then(|| {
                        Event::LowStock {
                            product_id,
                            quantity: record.quantity,
                            min_quantity: record.min_quantity,
                        }
                    });

                    Ok((
                        DeductResult {
                            consumption,
                            change: QuantityChange {
                                previous,
                                current: record.quantity,
                                delta: record.quantity - previous,
                            },
                        },
                        warning,
                    ))
                })
            })
            .await?;

        info!(
            product_id = %product_id,
            quantity = %quantity,
            reason,
            "Stock deducted"
        );

        self.emit(Event::StockDeducted {
            product_id,
            quantity,
            reason: reason.to_string(),
        })
        .await;

        if let Some(event) = warning {
            self.emit(event).await;
        }

        Ok(result)
    }

    /// Fetches an order by id.
    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(self.db.get_pool())
            .await
            .map_err(ServiceError::db_error)
    }

    /// Fetches the line items of an order.
    pub async fn get_order_items(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(self.db.get_pool())
            .await
            .map_err(ServiceError::db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn only_the_move_into_cancelled_reverses() {
        assert_eq!(
            transition_effect(OrderStatus::Pending, OrderStatus::Cancelled).unwrap(),
            InventoryEffect::ReverseInventory
        );
        assert_eq!(
            transition_effect(OrderStatus::Completed, OrderStatus::Cancelled).unwrap(),
            InventoryEffect::ReverseInventory
        );
        assert_eq!(
            transition_effect(OrderStatus::Pending, OrderStatus::Completed).unwrap(),
            InventoryEffect::None
        );
        assert_eq!(
            transition_effect(OrderStatus::Completed, OrderStatus::Pending).unwrap(),
            InventoryEffect::None
        );
    }

    #[test]
    fn cancelled_is_terminal() {
        for to in [
            OrderStatus::Pending,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
        ] {
            assert_matches!(
                transition_effect(OrderStatus::Cancelled, to),
                Err(ServiceError::InvalidOperation(_))
            );
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
        ] {
            let parsed = OrderStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(OrderStatus::from_str("refunded").is_err());
    }
}
