//! SQLite [`Repository`] implementation.
//!
//! Grounded in the teacher's `storage/sqlite/event_store.rs` and
//! `storage/schema.rs`: `sea_query::Iden` enums give type-safe column
//! names, queries are built with `sea-query` and rendered with
//! `SqliteQueryBuilder`, then executed through `sqlx::SqlitePool`.
//! JSON-shaped columns (`info`, `properties`, `options`, member id lists)
//! are stored as `TEXT` and (de)serialized with `serde_json`, the way the
//! teacher stores encoded protobuf bytes in a `BLOB` column.

use async_trait::async_trait;
use sea_query::{Expr, Iden, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::error::DbError;
use crate::model::{
    Cart, CartId, CartItem, CartStatus, CartType, CheckoutMethod, Collection, CollectionId,
    InventorySlot, Location, Media, ObjectInfo, OrderHistoryId, OrderHistoryRecord, Product,
    ProductId, Reservation, ReservationId, TrayNumber, UnitId, Variant, VariantId, VariantOption,
};

use super::{Repository, Result};

#[derive(Iden)]
enum Products {
    Table,
    Id,
    LastUpdate,
    ProductType,
    Tags,
    Info,
    Properties,
    VariantIds,
}

#[derive(Iden)]
enum Variants {
    Table,
    Id,
    ProductId,
    Price,
    ComparePrice,
    PriceFormatted,
    ComparePriceFormatted,
    Deleted,
    MediaFilename,
    MediaLastUpdate,
    Info,
    Properties,
    Options,
}

#[derive(Iden)]
enum Collections {
    Table,
    Id,
    LastUpdate,
    MediaFilename,
    MediaLastUpdate,
    Info,
    ProductIds,
}

#[derive(Iden)]
enum InventorySlots {
    Table,
    UnitId,
    TrayNumber,
    Location,
    VariantId,
    Width,
    Depth,
    Quantity,
}

#[derive(Iden)]
enum Carts {
    Table,
    Id,
    DisplayId,
    TransactionId,
    CartType,
    OrderInfo,
    Status,
    CheckoutMethod,
    LockedAt,
}

#[derive(Iden)]
enum CartItems {
    Table,
    CartId,
    VariantId,
    Amount,
}

#[derive(Iden)]
enum Reservations {
    Table,
    Id,
    CartId,
    VariantId,
    UnitId,
    Location,
    Quantity,
}

#[derive(Iden)]
enum OrderHistory {
    Table,
    Id,
    TransactionId,
    OrderInfo,
    CompletionStatus,
    CreatedAt,
}

fn db_err(func: &str, err: sqlx::Error) -> DbError {
    DbError::transient(func, err.to_string())
}

fn encode_info(info: &std::collections::HashMap<String, ObjectInfo>) -> String {
    serde_json::to_string(info).unwrap_or_default()
}

fn decode_info(raw: &str) -> std::collections::HashMap<String, ObjectInfo> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// SQLite-backed [`Repository`] (C2). Internally serialized by sqlx's
/// connection pool; callers take no external lock (spec.md §6).
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the schema if it does not already exist. Call once at
    /// startup before the repository is handed to other components.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY, last_update INTEGER NOT NULL, product_type TEXT NOT NULL,
                tags TEXT NOT NULL, info TEXT NOT NULL, properties TEXT NOT NULL, variant_ids TEXT NOT NULL)",
            "CREATE TABLE IF NOT EXISTS variants (
                id INTEGER PRIMARY KEY, product_id INTEGER NOT NULL, price INTEGER NOT NULL,
                compare_price INTEGER NOT NULL, price_formatted TEXT NOT NULL, compare_price_formatted TEXT NOT NULL,
                deleted INTEGER NOT NULL, media_filename TEXT, media_last_update INTEGER,
                info TEXT NOT NULL, properties TEXT NOT NULL, options TEXT NOT NULL)",
            "CREATE TABLE IF NOT EXISTS collections (
                id INTEGER PRIMARY KEY, last_update INTEGER NOT NULL, media_filename TEXT, media_last_update INTEGER,
                info TEXT NOT NULL, product_ids TEXT NOT NULL)",
            "CREATE TABLE IF NOT EXISTS inventory_slots (
                unit_id INTEGER NOT NULL, tray_number INTEGER NOT NULL, location INTEGER NOT NULL,
                variant_id INTEGER NOT NULL, width INTEGER NOT NULL, depth INTEGER NOT NULL, quantity INTEGER NOT NULL,
                PRIMARY KEY (unit_id, tray_number, location))",
            "CREATE TABLE IF NOT EXISTS carts (
                id INTEGER PRIMARY KEY AUTOINCREMENT, display_id INTEGER NOT NULL, transaction_id TEXT NOT NULL,
                cart_type TEXT NOT NULL, order_info TEXT NOT NULL, status TEXT NOT NULL,
                checkout_method TEXT NOT NULL, locked_at INTEGER NOT NULL)",
            "CREATE TABLE IF NOT EXISTS cart_items (
                cart_id INTEGER NOT NULL, variant_id INTEGER NOT NULL, amount INTEGER NOT NULL,
                PRIMARY KEY (cart_id, variant_id))",
            "CREATE TABLE IF NOT EXISTS reservations (
                id INTEGER PRIMARY KEY AUTOINCREMENT, cart_id INTEGER NOT NULL, variant_id INTEGER NOT NULL,
                unit_id INTEGER NOT NULL, location INTEGER NOT NULL, quantity INTEGER NOT NULL)",
            "CREATE TABLE IF NOT EXISTS order_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT, transaction_id TEXT NOT NULL, order_info TEXT NOT NULL,
                completion_status TEXT NOT NULL, created_at INTEGER NOT NULL)",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn upsert_product(&self, product: &Product) -> Result<()> {
        let query = Query::insert()
            .into_table(Products::Table)
            .columns([
                Products::Id,
                Products::LastUpdate,
                Products::ProductType,
                Products::Tags,
                Products::Info,
                Products::Properties,
                Products::VariantIds,
            ])
            .values_panic([
                product.id.0.into(),
                product.last_update.into(),
                product.product_type.clone().into(),
                product.tags.clone().into(),
                encode_info(&product.info).into(),
                serde_json::to_string(&product.properties).unwrap_or_default().into(),
                serde_json::to_string(&product.variant_ids.iter().map(|v| v.0).collect::<Vec<_>>())
                    .unwrap_or_default()
                    .into(),
            ])
            .on_conflict(
                sea_query::OnConflict::column(Products::Id)
                    .update_columns([
                        Products::LastUpdate,
                        Products::ProductType,
                        Products::Tags,
                        Products::Info,
                        Products::Properties,
                        Products::VariantIds,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("upsert_product", e))?;
        Ok(())
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        let query = Query::select()
            .columns([
                Products::Id,
                Products::LastUpdate,
                Products::ProductType,
                Products::Tags,
                Products::Info,
                Products::Properties,
                Products::VariantIds,
            ])
            .from(Products::Table)
            .and_where(Expr::col(Products::Id).eq(id.0))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get_product", e))?;
        Ok(row.map(|r| row_to_product(&r)))
    }

    async fn delete_product(&self, id: ProductId) -> Result<()> {
        let query = Query::delete()
            .from_table(Products::Table)
            .and_where(Expr::col(Products::Id).eq(id.0))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete_product", e))?;
        Ok(())
    }

    async fn list_products(&self) -> Result<Vec<Product>> {
        let query = Query::select()
            .columns([
                Products::Id,
                Products::LastUpdate,
                Products::ProductType,
                Products::Tags,
                Products::Info,
                Products::Properties,
                Products::VariantIds,
            ])
            .from(Products::Table)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_products", e))?;
        Ok(rows.iter().map(row_to_product).collect())
    }

    async fn upsert_variant(&self, variant: &Variant) -> Result<()> {
        let (media_filename, media_last_update) = match &variant.media {
            Some(m) => (Some(m.filename.clone()), Some(m.last_update)),
            None => (None, None),
        };
        let query = Query::insert()
            .into_table(Variants::Table)
            .columns([
                Variants::Id,
                Variants::ProductId,
                Variants::Price,
                Variants::ComparePrice,
                Variants::PriceFormatted,
                Variants::ComparePriceFormatted,
                Variants::Deleted,
                Variants::MediaFilename,
                Variants::MediaLastUpdate,
                Variants::Info,
                Variants::Properties,
                Variants::Options,
            ])
            .values_panic([
                variant.id.0.into(),
                variant.product_id.0.into(),
                variant.price.into(),
                variant.compare_price.into(),
                variant.price_formatted.clone().into(),
                variant.compare_price_formatted.clone().into(),
                variant.deleted.into(),
                media_filename.into(),
                media_last_update.into(),
                encode_info(&variant.info).into(),
                serde_json::to_string(&variant.properties).unwrap_or_default().into(),
                serde_json::to_string(&variant.options).unwrap_or_default().into(),
            ])
            .on_conflict(
                sea_query::OnConflict::column(Variants::Id)
                    .update_columns([
                        Variants::ProductId,
                        Variants::Price,
                        Variants::ComparePrice,
                        Variants::PriceFormatted,
                        Variants::ComparePriceFormatted,
                        Variants::Deleted,
                        Variants::MediaFilename,
                        Variants::MediaLastUpdate,
                        Variants::Info,
                        Variants::Properties,
                        Variants::Options,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("upsert_variant", e))?;
        Ok(())
    }

    async fn get_variant(&self, id: VariantId) -> Result<Option<Variant>> {
        let query = Query::select()
            .columns([
                Variants::Id,
                Variants::ProductId,
                Variants::Price,
                Variants::ComparePrice,
                Variants::PriceFormatted,
                Variants::ComparePriceFormatted,
                Variants::Deleted,
                Variants::MediaFilename,
                Variants::MediaLastUpdate,
                Variants::Info,
                Variants::Properties,
                Variants::Options,
            ])
            .from(Variants::Table)
            .and_where(Expr::col(Variants::Id).eq(id.0))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get_variant", e))?;
        Ok(row.map(|r| row_to_variant(&r)))
    }

    async fn delete_variant(&self, id: VariantId) -> Result<()> {
        let query = Query::delete()
            .from_table(Variants::Table)
            .and_where(Expr::col(Variants::Id).eq(id.0))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete_variant", e))?;
        Ok(())
    }

    async fn upsert_collection(&self, collection: &Collection) -> Result<()> {
        let (media_filename, media_last_update) = match &collection.media {
            Some(m) => (Some(m.filename.clone()), Some(m.last_update)),
            None => (None, None),
        };
        let query = Query::insert()
            .into_table(Collections::Table)
            .columns([
                Collections::Id,
                Collections::LastUpdate,
                Collections::MediaFilename,
                Collections::MediaLastUpdate,
                Collections::Info,
                Collections::ProductIds,
            ])
            .values_panic([
                collection.id.0.into(),
                collection.last_update.into(),
                media_filename.into(),
                media_last_update.into(),
                encode_info(&collection.info).into(),
                serde_json::to_string(&collection.product_ids.iter().map(|p| p.0).collect::<Vec<_>>())
                    .unwrap_or_default()
                    .into(),
            ])
            .on_conflict(
                sea_query::OnConflict::column(Collections::Id)
                    .update_columns([
                        Collections::LastUpdate,
                        Collections::MediaFilename,
                        Collections::MediaLastUpdate,
                        Collections::Info,
                        Collections::ProductIds,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("upsert_collection", e))?;
        Ok(())
    }

    async fn get_collection(&self, id: CollectionId) -> Result<Option<Collection>> {
        let query = Query::select()
            .columns([
                Collections::Id,
                Collections::LastUpdate,
                Collections::MediaFilename,
                Collections::MediaLastUpdate,
                Collections::Info,
                Collections::ProductIds,
            ])
            .from(Collections::Table)
            .and_where(Expr::col(Collections::Id).eq(id.0))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get_collection", e))?;
        Ok(row.map(|r| row_to_collection(&r)))
    }

    async fn delete_collection(&self, id: CollectionId) -> Result<()> {
        let query = Query::delete()
            .from_table(Collections::Table)
            .and_where(Expr::col(Collections::Id).eq(id.0))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete_collection", e))?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<Collection>> {
        let query = Query::select()
            .columns([
                Collections::Id,
                Collections::LastUpdate,
                Collections::MediaFilename,
                Collections::MediaLastUpdate,
                Collections::Info,
                Collections::ProductIds,
            ])
            .from(Collections::Table)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_collections", e))?;
        Ok(rows.iter().map(row_to_collection).collect())
    }

    async fn upsert_inventory_slot(&self, slot: &InventorySlot) -> Result<()> {
        let query = Query::insert()
            .into_table(InventorySlots::Table)
            .columns([
                InventorySlots::UnitId,
                InventorySlots::TrayNumber,
                InventorySlots::Location,
                InventorySlots::VariantId,
                InventorySlots::Width,
                InventorySlots::Depth,
                InventorySlots::Quantity,
            ])
            .values_panic([
                slot.unit_id.0.into(),
                slot.tray_number.0.into(),
                slot.location.0.into(),
                slot.variant_id.0.into(),
                slot.width.into(),
                slot.depth.into(),
                slot.quantity.into(),
            ])
            .on_conflict(
                sea_query::OnConflict::columns([
                    InventorySlots::UnitId,
                    InventorySlots::TrayNumber,
                    InventorySlots::Location,
                ])
                .update_columns([InventorySlots::VariantId, InventorySlots::Width, InventorySlots::Depth, InventorySlots::Quantity])
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("upsert_inventory_slot", e))?;
        Ok(())
    }

    async fn delete_inventory_slot(&self, unit_id: UnitId, tray_number: i32, location: i32) -> Result<()> {
        let query = Query::delete()
            .from_table(InventorySlots::Table)
            .and_where(Expr::col(InventorySlots::UnitId).eq(unit_id.0))
            .and_where(Expr::col(InventorySlots::TrayNumber).eq(tray_number))
            .and_where(Expr::col(InventorySlots::Location).eq(location))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete_inventory_slot", e))?;
        Ok(())
    }

    async fn list_inventory_slots(&self) -> Result<Vec<InventorySlot>> {
        let query = Query::select()
            .columns([
                InventorySlots::UnitId,
                InventorySlots::TrayNumber,
                InventorySlots::Location,
                InventorySlots::VariantId,
                InventorySlots::Width,
                InventorySlots::Depth,
                InventorySlots::Quantity,
            ])
            .from(InventorySlots::Table)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_inventory_slots", e))?;
        Ok(rows.iter().map(row_to_inventory_slot).collect())
    }

    async fn list_inventory_slots_for_unit(&self, unit_id: UnitId) -> Result<Vec<InventorySlot>> {
        let query = Query::select()
            .columns([
                InventorySlots::UnitId,
                InventorySlots::TrayNumber,
                InventorySlots::Location,
                InventorySlots::VariantId,
                InventorySlots::Width,
                InventorySlots::Depth,
                InventorySlots::Quantity,
            ])
            .from(InventorySlots::Table)
            .and_where(Expr::col(InventorySlots::UnitId).eq(unit_id.0))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_inventory_slots_for_unit", e))?;
        Ok(rows.iter().map(row_to_inventory_slot).collect())
    }

    async fn create_cart(&self, cart: &Cart) -> Result<CartId> {
        let query = Query::insert()
            .into_table(Carts::Table)
            .columns([
                Carts::DisplayId,
                Carts::TransactionId,
                Carts::CartType,
                Carts::OrderInfo,
                Carts::Status,
                Carts::CheckoutMethod,
                Carts::LockedAt,
            ])
            .values_panic([
                cart.display_id.into(),
                cart.transaction_id.0.clone().into(),
                cart_type_str(cart.cart_type).into(),
                cart.order_info.clone().into(),
                cart_status_str(cart.status).into(),
                checkout_method_str(cart.checkout_method).into(),
                cart.locked_at.into(),
            ])
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("create_cart", e))?;
        Ok(CartId(result.last_insert_rowid()))
    }

    async fn update_cart(&self, cart: &Cart) -> Result<()> {
        let query = Query::update()
            .table(Carts::Table)
            .values([
                (Carts::DisplayId, cart.display_id.into()),
                (Carts::TransactionId, cart.transaction_id.0.clone().into()),
                (Carts::CartType, cart_type_str(cart.cart_type).into()),
                (Carts::OrderInfo, cart.order_info.clone().into()),
                (Carts::Status, cart_status_str(cart.status).into()),
                (Carts::CheckoutMethod, checkout_method_str(cart.checkout_method).into()),
                (Carts::LockedAt, cart.locked_at.into()),
            ])
            .and_where(Expr::col(Carts::Id).eq(cart.id.0))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("update_cart", e))?;
        Ok(())
    }

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>> {
        let query = Query::select()
            .columns([
                Carts::Id,
                Carts::DisplayId,
                Carts::TransactionId,
                Carts::CartType,
                Carts::OrderInfo,
                Carts::Status,
                Carts::CheckoutMethod,
                Carts::LockedAt,
            ])
            .from(Carts::Table)
            .and_where(Expr::col(Carts::Id).eq(id.0))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get_cart", e))?;
        Ok(row.map(|r| row_to_cart(&r)))
    }

    async fn get_cart_by_transaction(&self, transaction_id: &crate::model::TransactionId) -> Result<Option<Cart>> {
        let query = Query::select()
            .columns([
                Carts::Id,
                Carts::DisplayId,
                Carts::TransactionId,
                Carts::CartType,
                Carts::OrderInfo,
                Carts::Status,
                Carts::CheckoutMethod,
                Carts::LockedAt,
            ])
            .from(Carts::Table)
            .and_where(Expr::col(Carts::TransactionId).eq(transaction_id.0.clone()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get_cart_by_transaction", e))?;
        Ok(row.map(|r| row_to_cart(&r)))
    }

    async fn delete_cart(&self, id: CartId) -> Result<()> {
        let query = Query::delete()
            .from_table(Carts::Table)
            .and_where(Expr::col(Carts::Id).eq(id.0))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete_cart", e))?;
        Ok(())
    }

    async fn list_carts(&self) -> Result<Vec<Cart>> {
        let query = Query::select()
            .columns([
                Carts::Id,
                Carts::DisplayId,
                Carts::TransactionId,
                Carts::CartType,
                Carts::OrderInfo,
                Carts::Status,
                Carts::CheckoutMethod,
                Carts::LockedAt,
            ])
            .from(Carts::Table)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_carts", e))?;
        Ok(rows.iter().map(row_to_cart).collect())
    }

    async fn upsert_cart_item(&self, item: &CartItem) -> Result<()> {
        let query = Query::insert()
            .into_table(CartItems::Table)
            .columns([CartItems::CartId, CartItems::VariantId, CartItems::Amount])
            .values_panic([item.cart_id.0.into(), item.variant_id.0.into(), item.amount.into()])
            .on_conflict(
                sea_query::OnConflict::columns([CartItems::CartId, CartItems::VariantId])
                    .update_column(CartItems::Amount)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("upsert_cart_item", e))?;
        Ok(())
    }

    async fn delete_cart_item(&self, cart_id: CartId, variant_id: VariantId) -> Result<()> {
        let query = Query::delete()
            .from_table(CartItems::Table)
            .and_where(Expr::col(CartItems::CartId).eq(cart_id.0))
            .and_where(Expr::col(CartItems::VariantId).eq(variant_id.0))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete_cart_item", e))?;
        Ok(())
    }

    async fn list_cart_items(&self, cart_id: CartId) -> Result<Vec<CartItem>> {
        let query = Query::select()
            .columns([CartItems::CartId, CartItems::VariantId, CartItems::Amount])
            .from(CartItems::Table)
            .and_where(Expr::col(CartItems::CartId).eq(cart_id.0))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_cart_items", e))?;
        Ok(rows
            .iter()
            .map(|r| CartItem {
                cart_id: CartId(r.get::<i64, _>(CartItems::CartId.to_string().as_str())),
                variant_id: VariantId(r.get::<i64, _>(CartItems::VariantId.to_string().as_str())),
                amount: r.get::<i32, _>(CartItems::Amount.to_string().as_str()),
            })
            .collect())
    }

    async fn create_reservation(&self, reservation: &Reservation) -> Result<ReservationId> {
        let query = Query::insert()
            .into_table(Reservations::Table)
            .columns([
                Reservations::CartId,
                Reservations::VariantId,
                Reservations::UnitId,
                Reservations::Location,
                Reservations::Quantity,
            ])
            .values_panic([
                reservation.cart_id.0.into(),
                reservation.variant_id.0.into(),
                reservation.unit_id.0.into(),
                reservation.location.0.into(),
                reservation.quantity.into(),
            ])
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("create_reservation", e))?;
        Ok(ReservationId(result.last_insert_rowid()))
    }

    async fn update_reservation(&self, reservation: &Reservation) -> Result<()> {
        let query = Query::update()
            .table(Reservations::Table)
            .values([
                (Reservations::CartId, reservation.cart_id.0.into()),
                (Reservations::VariantId, reservation.variant_id.0.into()),
                (Reservations::UnitId, reservation.unit_id.0.into()),
                (Reservations::Location, reservation.location.0.into()),
                (Reservations::Quantity, reservation.quantity.into()),
            ])
            .and_where(Expr::col(Reservations::Id).eq(reservation.id.0))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("update_reservation", e))?;
        Ok(())
    }

    async fn delete_reservation(&self, id: ReservationId) -> Result<()> {
        let query = Query::delete()
            .from_table(Reservations::Table)
            .and_where(Expr::col(Reservations::Id).eq(id.0))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete_reservation", e))?;
        Ok(())
    }

    async fn list_reservations(&self) -> Result<Vec<Reservation>> {
        let query = Query::select()
            .columns([
                Reservations::Id,
                Reservations::CartId,
                Reservations::VariantId,
                Reservations::UnitId,
                Reservations::Location,
                Reservations::Quantity,
            ])
            .from(Reservations::Table)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_reservations", e))?;
        Ok(rows.iter().map(row_to_reservation).collect())
    }

    async fn list_reservations_for_cart(&self, cart_id: CartId) -> Result<Vec<Reservation>> {
        let query = Query::select()
            .columns([
                Reservations::Id,
                Reservations::CartId,
                Reservations::VariantId,
                Reservations::UnitId,
                Reservations::Location,
                Reservations::Quantity,
            ])
            .from(Reservations::Table)
            .and_where(Expr::col(Reservations::CartId).eq(cart_id.0))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_reservations_for_cart", e))?;
        Ok(rows.iter().map(row_to_reservation).collect())
    }

    async fn create_order_history(&self, record: &OrderHistoryRecord) -> Result<OrderHistoryId> {
        let query = Query::insert()
            .into_table(OrderHistory::Table)
            .columns([
                OrderHistory::TransactionId,
                OrderHistory::OrderInfo,
                OrderHistory::CompletionStatus,
                OrderHistory::CreatedAt,
            ])
            .values_panic([
                record.transaction_id.0.clone().into(),
                record.order_info.clone().into(),
                completion_status_str(record.completion_status).into(),
                record.created_at.into(),
            ])
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("create_order_history", e))?;
        Ok(OrderHistoryId(result.last_insert_rowid()))
    }

    async fn delete_order_history(&self, id: OrderHistoryId) -> Result<()> {
        let query = Query::delete()
            .from_table(OrderHistory::Table)
            .and_where(Expr::col(OrderHistory::Id).eq(id.0))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete_order_history", e))?;
        Ok(())
    }

    async fn list_order_history(&self) -> Result<Vec<OrderHistoryRecord>> {
        let query = Query::select()
            .columns([
                OrderHistory::Id,
                OrderHistory::TransactionId,
                OrderHistory::OrderInfo,
                OrderHistory::CompletionStatus,
                OrderHistory::CreatedAt,
            ])
            .from(OrderHistory::Table)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_order_history", e))?;
        Ok(rows
            .iter()
            .map(|r| OrderHistoryRecord {
                id: OrderHistoryId(r.get::<i64, _>(OrderHistory::Id.to_string().as_str())),
                transaction_id: crate::model::TransactionId(
                    r.get::<String, _>(OrderHistory::TransactionId.to_string().as_str()),
                ),
                order_info: r.get::<String, _>(OrderHistory::OrderInfo.to_string().as_str()),
                completion_status: parse_completion_status(
                    &r.get::<String, _>(OrderHistory::CompletionStatus.to_string().as_str()),
                ),
                created_at: r.get::<i64, _>(OrderHistory::CreatedAt.to_string().as_str()),
            })
            .collect())
    }
}

fn row_to_product(row: &sqlx::sqlite::SqliteRow) -> Product {
    Product {
        id: ProductId(row.get::<i64, _>(Products::Id.to_string().as_str())),
        last_update: row.get::<i64, _>(Products::LastUpdate.to_string().as_str()),
        product_type: row.get::<String, _>(Products::ProductType.to_string().as_str()),
        tags: row.get::<String, _>(Products::Tags.to_string().as_str()),
        info: decode_info(&row.get::<String, _>(Products::Info.to_string().as_str())),
        properties: serde_json::from_str(&row.get::<String, _>(Products::Properties.to_string().as_str()))
            .unwrap_or_default(),
        variant_ids: serde_json::from_str::<Vec<i64>>(&row.get::<String, _>(Products::VariantIds.to_string().as_str()))
            .unwrap_or_default()
            .into_iter()
            .map(VariantId)
            .collect(),
    }
}

fn row_to_variant(row: &sqlx::sqlite::SqliteRow) -> Variant {
    let media_filename: Option<String> = row.get(Variants::MediaFilename.to_string().as_str());
    let media_last_update: Option<i64> = row.get(Variants::MediaLastUpdate.to_string().as_str());
    Variant {
        id: VariantId(row.get::<i64, _>(Variants::Id.to_string().as_str())),
        product_id: ProductId(row.get::<i64, _>(Variants::ProductId.to_string().as_str())),
        price: row.get::<i64, _>(Variants::Price.to_string().as_str()),
        compare_price: row.get::<i64, _>(Variants::ComparePrice.to_string().as_str()),
        price_formatted: row.get::<String, _>(Variants::PriceFormatted.to_string().as_str()),
        compare_price_formatted: row.get::<String, _>(Variants::ComparePriceFormatted.to_string().as_str()),
        deleted: row.get::<bool, _>(Variants::Deleted.to_string().as_str()),
        media: media_filename.map(|filename| Media {
            filename,
            last_update: media_last_update.unwrap_or_default(),
        }),
        info: decode_info(&row.get::<String, _>(Variants::Info.to_string().as_str())),
        properties: serde_json::from_str(&row.get::<String, _>(Variants::Properties.to_string().as_str()))
            .unwrap_or_default(),
        options: serde_json::from_str::<Vec<VariantOption>>(&row.get::<String, _>(Variants::Options.to_string().as_str()))
            .unwrap_or_default(),
    }
}

fn row_to_collection(row: &sqlx::sqlite::SqliteRow) -> Collection {
    let media_filename: Option<String> = row.get(Collections::MediaFilename.to_string().as_str());
    let media_last_update: Option<i64> = row.get(Collections::MediaLastUpdate.to_string().as_str());
    Collection {
        id: CollectionId(row.get::<i64, _>(Collections::Id.to_string().as_str())),
        last_update: row.get::<i64, _>(Collections::LastUpdate.to_string().as_str()),
        media: media_filename.map(|filename| Media {
            filename,
            last_update: media_last_update.unwrap_or_default(),
        }),
        info: decode_info(&row.get::<String, _>(Collections::Info.to_string().as_str())),
        product_ids: serde_json::from_str::<Vec<i64>>(&row.get::<String, _>(Collections::ProductIds.to_string().as_str()))
            .unwrap_or_default()
            .into_iter()
            .map(ProductId)
            .collect(),
    }
}

fn row_to_inventory_slot(row: &sqlx::sqlite::SqliteRow) -> InventorySlot {
    InventorySlot {
        unit_id: UnitId(row.get::<i32, _>(InventorySlots::UnitId.to_string().as_str())),
        tray_number: TrayNumber(row.get::<i32, _>(InventorySlots::TrayNumber.to_string().as_str())),
        location: Location(row.get::<i32, _>(InventorySlots::Location.to_string().as_str())),
        variant_id: VariantId(row.get::<i64, _>(InventorySlots::VariantId.to_string().as_str())),
        width: row.get::<i32, _>(InventorySlots::Width.to_string().as_str()),
        depth: row.get::<i32, _>(InventorySlots::Depth.to_string().as_str()),
        quantity: row.get::<i32, _>(InventorySlots::Quantity.to_string().as_str()),
    }
}

fn row_to_cart(row: &sqlx::sqlite::SqliteRow) -> Cart {
    Cart {
        id: CartId(row.get::<i64, _>(Carts::Id.to_string().as_str())),
        display_id: row.get::<i32, _>(Carts::DisplayId.to_string().as_str()),
        transaction_id: crate::model::TransactionId(row.get::<String, _>(Carts::TransactionId.to_string().as_str())),
        cart_type: parse_cart_type(&row.get::<String, _>(Carts::CartType.to_string().as_str())),
        order_info: row.get::<String, _>(Carts::OrderInfo.to_string().as_str()),
        status: parse_cart_status(&row.get::<String, _>(Carts::Status.to_string().as_str())),
        checkout_method: parse_checkout_method(&row.get::<String, _>(Carts::CheckoutMethod.to_string().as_str())),
        locked_at: row.get::<i64, _>(Carts::LockedAt.to_string().as_str()),
    }
}

fn row_to_reservation(row: &sqlx::sqlite::SqliteRow) -> Reservation {
    Reservation {
        id: ReservationId(row.get::<i64, _>(Reservations::Id.to_string().as_str())),
        cart_id: CartId(row.get::<i64, _>(Reservations::CartId.to_string().as_str())),
        variant_id: VariantId(row.get::<i64, _>(Reservations::VariantId.to_string().as_str())),
        unit_id: UnitId(row.get::<i32, _>(Reservations::UnitId.to_string().as_str())),
        location: Location(row.get::<i32, _>(Reservations::Location.to_string().as_str())),
        quantity: row.get::<i32, _>(Reservations::Quantity.to_string().as_str()),
    }
}

fn cart_type_str(t: CartType) -> &'static str {
    match t {
        CartType::Local => "local",
        CartType::Remote => "remote",
    }
}

fn parse_cart_type(s: &str) -> CartType {
    match s {
        "remote" => CartType::Remote,
        _ => CartType::Local,
    }
}

fn cart_status_str(s: CartStatus) -> &'static str {
    match s {
        CartStatus::Created => "created",
        CartStatus::Prereservation => "prereservation",
        CartStatus::Reserved => "reserved",
        CartStatus::Checkout => "checkout",
        CartStatus::Dispensing => "dispensing",
        CartStatus::Complete => "complete",
    }
}

fn parse_cart_status(s: &str) -> CartStatus {
    match s {
        "prereservation" => CartStatus::Prereservation,
        "reserved" => CartStatus::Reserved,
        "checkout" => CartStatus::Checkout,
        "dispensing" => CartStatus::Dispensing,
        "complete" => CartStatus::Complete,
        _ => CartStatus::Created,
    }
}

fn checkout_method_str(m: CheckoutMethod) -> &'static str {
    match m {
        CheckoutMethod::Undefined => "undefined",
        CheckoutMethod::Mobile => "mobile",
        CheckoutMethod::Local => "local",
        CheckoutMethod::Pickup => "pickup",
    }
}

fn parse_checkout_method(s: &str) -> CheckoutMethod {
    match s {
        "mobile" => CheckoutMethod::Mobile,
        "local" => CheckoutMethod::Local,
        "pickup" => CheckoutMethod::Pickup,
        _ => CheckoutMethod::Undefined,
    }
}

fn completion_status_str(s: crate::model::CompletionStatus) -> &'static str {
    match s {
        crate::model::CompletionStatus::Expired => "expired",
        crate::model::CompletionStatus::Dispensed => "dispensed",
    }
}

fn parse_completion_status(s: &str) -> crate::model::CompletionStatus {
    match s {
        "dispensed" => crate::model::CompletionStatus::Dispensed,
        _ => crate::model::CompletionStatus::Expired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn test_repo() -> SqliteRepository {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let repo = SqliteRepository::new(pool);
        repo.migrate().await.unwrap();
        repo
    }

    #[tokio::test]
    async fn product_roundtrips_through_upsert_and_get() {
        let repo = test_repo().await;
        let product = Product {
            id: ProductId(1),
            last_update: 100,
            product_type: "snack".to_string(),
            tags: "salty".to_string(),
            info: HashMap::new(),
            properties: HashMap::new(),
            variant_ids: vec![VariantId(10), VariantId(11)],
        };
        repo.upsert_product(&product).await.unwrap();
        let fetched = repo.get_product(ProductId(1)).await.unwrap().unwrap();
        assert_eq!(fetched.variant_ids, vec![VariantId(10), VariantId(11)]);
    }

    #[tokio::test]
    async fn cart_create_then_update_then_get() {
        let repo = test_repo().await;
        let cart = Cart {
            id: CartId(0),
            display_id: 1,
            transaction_id: crate::model::TransactionId::unassigned(1),
            cart_type: CartType::Local,
            order_info: "{}".to_string(),
            status: CartStatus::Created,
            checkout_method: CheckoutMethod::Undefined,
            locked_at: 0,
        };
        let id = repo.create_cart(&cart).await.unwrap();
        let mut updated = cart;
        updated.id = id;
        updated.status = CartStatus::Reserved;
        repo.update_cart(&updated).await.unwrap();

        let fetched = repo.get_cart(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, CartStatus::Reserved);
    }

    #[tokio::test]
    async fn inventory_slot_upsert_is_idempotent_on_key() {
        let repo = test_repo().await;
        let slot = InventorySlot {
            unit_id: UnitId(1),
            tray_number: TrayNumber(2),
            location: Location(3),
            variant_id: VariantId(5),
            width: 1,
            depth: 1,
            quantity: 4,
        };
        repo.upsert_inventory_slot(&slot).await.unwrap();
        let mut restocked = slot;
        restocked.quantity = 9;
        repo.upsert_inventory_slot(&restocked).await.unwrap();

        let slots = repo.list_inventory_slots_for_unit(UnitId(1)).await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].quantity, 9);
    }

    #[tokio::test]
    async fn reservation_create_then_delete() {
        let repo = test_repo().await;
        let reservation = Reservation {
            id: ReservationId(0),
            cart_id: CartId(1),
            variant_id: VariantId(2),
            unit_id: UnitId(1),
            location: Location(1),
            quantity: 2,
        };
        let id = repo.create_reservation(&reservation).await.unwrap();
        assert_eq!(repo.list_reservations_for_cart(CartId(1)).await.unwrap().len(), 1);
        repo.delete_reservation(id).await.unwrap();
        assert!(repo.list_reservations_for_cart(CartId(1)).await.unwrap().is_empty());
    }
}
