//! Shared domain entities (spec.md §3).
//!
//! Identifiers are wrapped in newtypes rather than passed as bare
//! primitives: a single-field tuple struct around one inner value, the
//! same wrapper idiom the teacher uses for its service handles
//! (`EventServiceHandle`, `LogServiceHandle` in
//! `handlers/projectors/{event,log}.rs`), generalized here to typed ids
//! instead of typed handles.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Local autoincrement id for a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CartId(pub i64);

/// Local autoincrement id for a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationId(pub i64);

/// Local autoincrement id for an order history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderHistoryId(pub i64);

/// Cloud-assigned catalog identifier (products, collections, variants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(pub i64);

/// Dispenser unit, tray and slot addressing (spec.md GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrayNumber(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location(pub i32);

/// Cloud-issued transaction id, or the synthetic placeholder used before
/// one is assigned (spec.md §3, invariant 5).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn unassigned(display_id: i32) -> Self {
        Self(format!("unassigned#{display_id}"))
    }

    pub fn is_unassigned(&self) -> bool {
        self.0.starts_with("unassigned#")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartType {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CartStatus {
    Created,
    Prereservation,
    Reserved,
    Checkout,
    Dispensing,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckoutMethod {
    Undefined,
    Mobile,
    Local,
    Pickup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Expired,
    Dispensed,
}

/// Result of a cart/reservation operation (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Ok,
    Nok,
    Pending,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cart {
    pub id: CartId,
    pub display_id: i32,
    pub transaction_id: TransactionId,
    pub cart_type: CartType,
    pub order_info: String,
    pub status: CartStatus,
    pub checkout_method: CheckoutMethod,
    /// Unix timestamp (seconds) of the last status-changing mutation.
    pub locked_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartItem {
    pub cart_id: CartId,
    pub variant_id: VariantId,
    pub amount: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub id: ReservationId,
    pub cart_id: CartId,
    pub variant_id: VariantId,
    pub unit_id: UnitId,
    pub location: Location,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventorySlot {
    pub unit_id: UnitId,
    pub tray_number: TrayNumber,
    pub location: Location,
    pub variant_id: VariantId,
    pub width: i32,
    pub depth: i32,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryKey {
    pub unit_id: UnitId,
    pub tray_number: TrayNumber,
    pub location: Location,
}

impl InventorySlot {
    pub fn key(&self) -> InventoryKey {
        InventoryKey {
            unit_id: self.unit_id,
            tray_number: self.tray_number,
            location: self.location,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHistoryRecord {
    pub id: OrderHistoryId,
    pub transaction_id: TransactionId,
    pub order_info: String,
    pub completion_status: CompletionStatus,
    pub created_at: i64,
}

/// Per-language display text (spec.md §3, `localized {name, description}`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectProperty {
    pub prop_type: String,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub filename: String,
    pub last_update: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantOption {
    pub option: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub id: VariantId,
    pub product_id: ProductId,
    pub price: i64,
    pub compare_price: i64,
    pub price_formatted: String,
    pub compare_price_formatted: String,
    pub deleted: bool,
    pub media: Option<Media>,
    pub info: HashMap<String, ObjectInfo>,
    pub properties: HashMap<String, Vec<ObjectProperty>>,
    pub options: Vec<VariantOption>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub id: ProductId,
    pub last_update: i64,
    pub product_type: String,
    pub tags: String,
    pub info: HashMap<String, ObjectInfo>,
    pub properties: HashMap<String, Vec<ObjectProperty>>,
    pub variant_ids: Vec<VariantId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub id: CollectionId,
    pub last_update: i64,
    pub media: Option<Media>,
    pub info: HashMap<String, ObjectInfo>,
    pub product_ids: Vec<ProductId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_transaction_id_roundtrips_display() {
        let tx = TransactionId::unassigned(2);
        assert_eq!(tx.0, "unassigned#2");
        assert!(tx.is_unassigned());
    }

    #[test]
    fn real_transaction_id_is_not_unassigned() {
        let tx = TransactionId("T1".to_string());
        assert!(!tx.is_unassigned());
    }
}
