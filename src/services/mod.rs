pub mod batch_store;
pub mod fulfillment;
pub mod inventory_summary;

use crate::entities::product::{self, Entity as ProductEntity};
use crate::errors::ServiceError;
use sea_orm::{ConnectionTrait, EntityTrait};
use uuid::Uuid;

/// Looks up a product or fails with `NotFound` before anything is mutated.
pub(crate) async fn find_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<product::Model, ServiceError> {
    ProductEntity::find_by_id(product_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
}
