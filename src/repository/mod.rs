//! Persistence repository (C2, spec.md §3, §6).
//!
//! "Typed CRUD on each entity... all methods are thread-safe." The trait
//! shape mirrors the teacher's `EventStore`/`SnapshotStore` split in
//! `src/storage/mod.rs`: one narrow `#[async_trait]` per concern, `Result`
//! aliased to the crate's subsystem error, implementations behind `Arc`.

use async_trait::async_trait;

use crate::error::DbError;
use crate::model::{
    Cart, CartId, CartItem, Collection, CollectionId, InventorySlot, OrderHistoryId,
    OrderHistoryRecord, Product, ProductId, Reservation, ReservationId, UnitId, Variant, VariantId,
};

pub mod sqlite;

pub use sqlite::SqliteRepository;

pub type Result<T> = std::result::Result<T, DbError>;

/// Typed CRUD surface over the local relational store (spec.md §6).
/// Implementations must serialize concurrent access internally; callers
/// never take an external lock.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert_product(&self, product: &Product) -> Result<()>;
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>>;
    async fn delete_product(&self, id: ProductId) -> Result<()>;
    async fn list_products(&self) -> Result<Vec<Product>>;

    async fn upsert_variant(&self, variant: &Variant) -> Result<()>;
    async fn get_variant(&self, id: VariantId) -> Result<Option<Variant>>;
    async fn delete_variant(&self, id: VariantId) -> Result<()>;

    async fn upsert_collection(&self, collection: &Collection) -> Result<()>;
    async fn get_collection(&self, id: CollectionId) -> Result<Option<Collection>>;
    async fn delete_collection(&self, id: CollectionId) -> Result<()>;
    async fn list_collections(&self) -> Result<Vec<Collection>>;

    async fn upsert_inventory_slot(&self, slot: &InventorySlot) -> Result<()>;
    async fn delete_inventory_slot(&self, unit_id: UnitId, tray_number: i32, location: i32) -> Result<()>;
    async fn list_inventory_slots(&self) -> Result<Vec<InventorySlot>>;
    async fn list_inventory_slots_for_unit(&self, unit_id: UnitId) -> Result<Vec<InventorySlot>>;

    async fn create_cart(&self, cart: &Cart) -> Result<CartId>;
    async fn update_cart(&self, cart: &Cart) -> Result<()>;
    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>>;
    async fn get_cart_by_transaction(&self, transaction_id: &crate::model::TransactionId) -> Result<Option<Cart>>;
    async fn delete_cart(&self, id: CartId) -> Result<()>;
    async fn list_carts(&self) -> Result<Vec<Cart>>;

    async fn upsert_cart_item(&self, item: &CartItem) -> Result<()>;
    async fn delete_cart_item(&self, cart_id: CartId, variant_id: VariantId) -> Result<()>;
    async fn list_cart_items(&self, cart_id: CartId) -> Result<Vec<CartItem>>;

    async fn create_reservation(&self, reservation: &Reservation) -> Result<ReservationId>;
    async fn update_reservation(&self, reservation: &Reservation) -> Result<()>;
    async fn delete_reservation(&self, id: ReservationId) -> Result<()>;
    async fn list_reservations(&self) -> Result<Vec<Reservation>>;
    async fn list_reservations_for_cart(&self, cart_id: CartId) -> Result<Vec<Reservation>>;

    async fn create_order_history(&self, record: &OrderHistoryRecord) -> Result<OrderHistoryId>;
    async fn delete_order_history(&self, id: OrderHistoryId) -> Result<()>;
    async fn list_order_history(&self) -> Result<Vec<OrderHistoryRecord>>;
}
