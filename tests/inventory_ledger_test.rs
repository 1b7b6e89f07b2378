mod common;

use assert_matches::assert_matches;
use chrono::{Days, Utc};
use comanda_api::errors::ServiceError;
use comanda_api::services::batch_store::ReceiveStockRequest;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::TestLedger;

fn receive_request(
    product_id: Uuid,
    quantity: Decimal,
    unit_cost: Decimal,
    expiry_in_days: Option<u64>,
) -> ReceiveStockRequest {
    ReceiveStockRequest {
        product_id,
        quantity,
        unit_cost,
        expiry_date: expiry_in_days.map(|days| {
            Utc::now()
                .date_naive()
                .checked_add_days(Days::new(days))
                .expect("expiry date in range")
        }),
        supplier: None,
        notes: None,
    }
}

#[tokio::test]
async fn receiving_accumulates_quantity_and_weighted_average() {
    let ledger = TestLedger::new().await;
    let product = ledger
        .seed_product("Tomato sauce", dec!(4.00), Some(dec!(1.20)))
        .await;

    ledger
        .state
        .fulfillment
        .receive_stock(receive_request(product.id, dec!(10), dec!(2.00), Some(30)))
        .await
        .unwrap();
    let second = ledger
        .state
        .fulfillment
        .receive_stock(receive_request(product.id, dec!(5), dec!(3.50), Some(60)))
        .await
        .unwrap();

    // (10 * 2.00 + 5 * 3.50) / 15 = 2.50
    assert_eq!(second.record.quantity, dec!(15));
    assert_eq!(second.record.avg_cost, dec!(2.5));

    let batches = ledger.state.batch_store.list_active(product.id).await.unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].quantity, dec!(10));
    assert_eq!(batches[0].original_quantity, dec!(10));
    assert_eq!(batches[0].unit_cost, dec!(2.00));
}

#[tokio::test]
async fn receiving_rejects_non_positive_amounts() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Flour", dec!(2.00), None).await;

    let err = ledger
        .state
        .fulfillment
        .receive_stock(receive_request(product.id, Decimal::ZERO, dec!(1.00), None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = ledger
        .state
        .fulfillment
        .receive_stock(receive_request(product.id, dec!(-3), dec!(1.00), None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = ledger
        .state
        .fulfillment
        .receive_stock(receive_request(product.id, dec!(3), Decimal::ZERO, None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    assert!(ledger
        .state
        .batch_store
        .list_active(product.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn receiving_rejects_already_expired_stock() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Cream", dec!(3.00), None).await;

    let mut request = receive_request(product.id, dec!(5), dec!(1.50), None);
    request.expiry_date = Utc::now().date_naive().checked_sub_days(Days::new(1));

    let err = ledger
        .state
        .fulfillment
        .receive_stock(request)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    // Rejected before any mutation: no batch, no record.
    assert!(ledger
        .state
        .batch_store
        .list_active(product.id)
        .await
        .unwrap()
        .is_empty());
    assert!(ledger
        .state
        .inventory_summary
        .get_record(product.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn receiving_rejects_unknown_product() {
    let ledger = TestLedger::new().await;

    let err = ledger
        .state
        .fulfillment
        .receive_stock(receive_request(Uuid::new_v4(), dec!(5), dec!(1.00), None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn active_batches_are_listed_in_consumption_order() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Basil", dec!(1.00), None).await;
    let fulfillment = &ledger.state.fulfillment;

    // Received first but expiring last, expiring first, and no expiry.
    fulfillment
        .receive_stock(receive_request(product.id, dec!(1), dec!(1.00), Some(90)))
        .await
        .unwrap();
    fulfillment
        .receive_stock(receive_request(product.id, dec!(2), dec!(1.00), Some(10)))
        .await
        .unwrap();
    fulfillment
        .receive_stock(receive_request(product.id, dec!(3), dec!(1.00), None))
        .await
        .unwrap();

    let batches = ledger.state.batch_store.list_active(product.id).await.unwrap();
    let quantities: Vec<Decimal> = batches.iter().map(|b| b.quantity).collect();
    assert_eq!(quantities, vec![dec!(2), dec!(1), dec!(3)]);
}

#[tokio::test]
async fn manual_adjust_captures_before_and_after() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Olive oil", dec!(8.00), Some(dec!(5.00))).await;

    ledger
        .state
        .fulfillment
        .receive_stock(receive_request(product.id, dec!(10), dec!(5.00), None))
        .await
        .unwrap();

    let change = ledger
        .state
        .fulfillment
        .manual_adjust(product.id, dec!(-3), "breakage")
        .await
        .unwrap();

    assert_eq!(change.previous, dec!(10));
    assert_eq!(change.current, dec!(7));
    assert_eq!(change.delta, dec!(-3));

    let record = ledger
        .state
        .inventory_summary
        .get_record(product.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.quantity, dec!(7));

    // Batches are not attributed for manual corrections.
    let batches = ledger.state.batch_store.list_active(product.id).await.unwrap();
    assert_eq!(batches[0].quantity, dec!(10));
}

#[tokio::test]
async fn manual_adjust_never_goes_below_zero() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Saffron", dec!(30.00), None).await;

    ledger
        .state
        .fulfillment
        .receive_stock(receive_request(product.id, dec!(2), dec!(20.00), None))
        .await
        .unwrap();

    let err = ledger
        .state
        .fulfillment
        .manual_adjust(product.id, dec!(-5), "recount")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let record = ledger
        .state
        .inventory_summary
        .get_record(product.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.quantity, dec!(2));
}

#[tokio::test]
async fn manual_adjust_creates_record_for_untracked_product() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Napkins", dec!(0.50), Some(dec!(0.10))).await;

    let change = ledger
        .state
        .fulfillment
        .manual_adjust(product.id, dec!(40), "initial count")
        .await
        .unwrap();

    assert_eq!(change.previous, Decimal::ZERO);
    assert_eq!(change.current, dec!(40));

    let record = ledger
        .state
        .inventory_summary
        .get_record(product.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.quantity, dec!(40));
    assert_eq!(record.avg_cost, dec!(0.10));
}

#[tokio::test]
async fn deduct_walks_batches_and_updates_the_record() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Mozzarella", dec!(6.00), None).await;
    let fulfillment = &ledger.state.fulfillment;

    fulfillment
        .receive_stock(receive_request(product.id, dec!(5), dec!(10.00), Some(10)))
        .await
        .unwrap();
    fulfillment
        .receive_stock(receive_request(product.id, dec!(5), dec!(12.00), Some(40)))
        .await
        .unwrap();

    let result = fulfillment.deduct(product.id, dec!(7), "spoilage").await.unwrap();

    assert_eq!(result.consumption.shortfall, Decimal::ZERO);
    assert_eq!(result.consumption.lines.len(), 2);
    assert_eq!(result.consumption.lines[0].quantity_taken, dec!(5));
    assert_eq!(result.consumption.lines[0].unit_cost, dec!(10.00));
    assert_eq!(result.consumption.lines[1].quantity_taken, dec!(2));
    assert_eq!(result.consumption.lines[1].unit_cost, dec!(12.00));
    assert_eq!(result.change.previous, dec!(10));
    assert_eq!(result.change.current, dec!(3));

    // The drained batch drops out of the active listing.
    let batches = ledger.state.batch_store.list_active(product.id).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].quantity, dec!(3));
}

#[tokio::test]
async fn deduct_fails_whole_without_partial_batch_decrements() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Parmesan", dec!(9.00), None).await;
    let fulfillment = &ledger.state.fulfillment;

    fulfillment
        .receive_stock(receive_request(product.id, dec!(5), dec!(10.00), Some(10)))
        .await
        .unwrap();
    fulfillment
        .receive_stock(receive_request(product.id, dec!(3), dec!(12.00), Some(40)))
        .await
        .unwrap();

    let err = fulfillment.deduct(product.id, dec!(20), "recount").await.unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    let batches = ledger.state.batch_store.list_active(product.id).await.unwrap();
    let quantities: Vec<Decimal> = batches.iter().map(|b| b.quantity).collect();
    assert_eq!(quantities, vec![dec!(5), dec!(3)]);

    let record = ledger
        .state
        .inventory_summary
        .get_record(product.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.quantity, dec!(8));
}

#[tokio::test]
async fn deduct_respects_a_drifted_low_aggregate() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Anchovies", dec!(5.00), None).await;
    let fulfillment = &ledger.state.fulfillment;

    fulfillment
        .receive_stock(receive_request(product.id, dec!(5), dec!(4.00), None))
        .await
        .unwrap();
    // Manual correction drops the aggregate below the batch total.
    fulfillment
        .manual_adjust(product.id, dec!(-3), "recount")
        .await
        .unwrap();

    let err = fulfillment.deduct(product.id, dec!(4), "spoilage").await.unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    // Nothing moved: deduction never drives the record below zero.
    let batches = ledger.state.batch_store.list_active(product.id).await.unwrap();
    assert_eq!(batches[0].quantity, dec!(5));
    let record = ledger
        .state
        .inventory_summary
        .get_record(product.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.quantity, dec!(2));
}

#[tokio::test]
async fn deduct_rejects_non_positive_quantity() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Capers", dec!(3.00), None).await;

    let err = ledger
        .state
        .fulfillment
        .deduct(product.id, Decimal::ZERO, "noop")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn thresholds_and_categories_are_metadata_updates() {
    let ledger = TestLedger::new().await;
    let product = ledger.seed_product("Espresso beans", dec!(12.00), None).await;
    let category_id = Uuid::new_v4();

    ledger
        .state
        .fulfillment
        .receive_stock(receive_request(product.id, dec!(20), dec!(7.00), None))
        .await
        .unwrap();

    let summary = &ledger.state.inventory_summary;
    let db = ledger.state.db.as_ref();

    let record = summary
        .set_reorder_threshold(db, product.id, dec!(5))
        .await
        .unwrap();
    assert_eq!(record.min_quantity, dec!(5));

    let record = summary
        .set_category(db, product.id, Some(category_id))
        .await
        .unwrap();
    assert_eq!(record.category_id, Some(category_id));

    // Quantity and average are untouched by metadata updates.
    assert_eq!(record.quantity, dec!(20));
    assert_eq!(record.avg_cost, dec!(7.00));
}
