//! Read-only product lookups used to snapshot order lines.

use async_trait::async_trait;

use crate::model::{Product, ProductId};
use crate::runner::Ctx;
use crate::store::{Store, StoreError};

/// Catalog read port. Implementations must not mutate products.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Fetch all requested products in one batched read. Unknown ids are
    /// simply absent from the result. Reads through the context's live
    /// transaction when there is one.
    async fn products(&self, ctx: &mut Ctx, ids: &[ProductId]) -> Result<Vec<Product>, StoreError>;
}

#[async_trait]
impl Catalog for Store {
    async fn products(&self, ctx: &mut Ctx, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        match ctx.live_tx() {
            Some(tx) => tx.products(ids).await,
            None => Store::products(self, ids).await,
        }
    }
}
