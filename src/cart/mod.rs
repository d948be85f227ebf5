//! Cart & Reservation Engine (C5, spec.md §4.4).
//!
//! Grounded in `logic/cart.py`'s `CartLogic`: a single-threaded worker
//! draining a command queue, translated the way [`crate::planogram`]
//! translates its sibling module — `Condition`+`deque` becomes an
//! `mpsc`-channel-drained task. The direct-call API
//! (`update`/`clear`/`prolong`/`reserve`/`dispense`) is exposed through
//! [`CartEngineHandle`], which serializes every call through that same
//! worker via a oneshot reply, per SPEC_FULL.md §4.4's resolution of the
//! "must not bypass the worker" open question.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, EventKind};
use crate::cloud::CloudClient;
use crate::config::Config;
use crate::error::{DbError, KioskError, ProtocolError};
use crate::machine::MachineState;
use crate::model::{
    Cart, CartId, CartItem, CartStatus, CartType, CheckoutMethod, CompletionStatus, Location,
    OperationResult, OrderHistoryId, OrderHistoryRecord, Reservation, TransactionId, UnitId,
    VariantId,
};
use crate::repository::Repository;

/// One pending expiration: the owning id (cart or order-history record)
/// plus a monotonic deadline.
#[derive(Debug, Clone, Copy)]
struct ExpirationItem<Id> {
    id: Id,
    deadline: Instant,
}

/// A dispense request that arrived while the machine FSM reported `BUSY`
/// (spec.md §4.4: "if hardware/queue busy, enqueues a pending request").
#[derive(Debug, Clone)]
struct PendingDispensing {
    transaction_id: TransactionId,
    display_id: i32,
}

enum CartCommand {
    Update {
        transaction_id: TransactionId,
        display_id: i32,
        cart_type: CartType,
        variant_id: VariantId,
        amount: i32,
        reply: oneshot::Sender<(OperationResult, String)>,
    },
    Clear {
        transaction_id: TransactionId,
        reply: oneshot::Sender<(OperationResult, String)>,
    },
    Prolong {
        transaction_id: TransactionId,
        reply: oneshot::Sender<(OperationResult, String)>,
    },
    Reserve {
        transaction_id: TransactionId,
        order_info: String,
        reply: oneshot::Sender<(OperationResult, String)>,
    },
    Dispense {
        transaction_id: TransactionId,
        display_id: i32,
        reply: oneshot::Sender<(OperationResult, String)>,
    },
    BeginTransaction {
        cart_id: CartId,
    },
    TransactionCompleted {
        transaction_id: TransactionId,
        success: bool,
    },
    ReservationRequestUpdate {
        transaction_id: TransactionId,
        variant_id: VariantId,
        amount: i32,
        request_id: i64,
    },
    ReservationRequestCancel {
        transaction_id: TransactionId,
    },
    ReservationRequestProlong {
        transaction_id: TransactionId,
    },
    ReservationRequestConfirm {
        transaction_id: TransactionId,
        pickup_code: String,
    },
    PlanogramWasUpdated,
    PurchaseFinished {
        cart_id: CartId,
    },
    MachineStateChanged {
        state: MachineState,
    },
    ProcessPendingReservations(PendingDispensing),
}

/// Parsed inbound `reservation`/`transaction` topic notification
/// (spec.md §4.4, "Remote cart inbound protocol").
#[derive(Debug, PartialEq, Eq)]
pub enum CartInboundEvent {
    ReservationUpdate { transaction_id: TransactionId, variant_id: VariantId, amount: i32, request_id: i64 },
    ReservationCancel { transaction_id: TransactionId },
    ReservationProlong { transaction_id: TransactionId },
    ReservationConfirm { transaction_id: TransactionId, pickup_code: String },
    TransactionUpdate { transaction_id: TransactionId, success: bool },
}

/// Parse an inbound IoT-topic payload (spec.md §6 JSON shapes).
pub fn parse_inbound(topic: &str, payload: &[u8]) -> Result<CartInboundEvent, ProtocolError> {
    let err = |message: String| ProtocolError { topic: topic.to_string(), message };
    let text = std::str::from_utf8(payload).map_err(|e| err(e.to_string()))?;
    let data: serde_json::Value = serde_json::from_str(text).map_err(|e| err(e.to_string()))?;

    match topic {
        "reservation" => {
            let transaction_id = TransactionId(
                data.get("transactionId").and_then(serde_json::Value::as_str).ok_or_else(|| err("missing transactionId".to_string()))?.to_string(),
            );
            let update_type = data.get("updateType").and_then(serde_json::Value::as_str).ok_or_else(|| err("missing updateType".to_string()))?;
            match update_type {
                "update" => Ok(CartInboundEvent::ReservationUpdate {
                    transaction_id,
                    variant_id: VariantId(data.get("variantId").and_then(serde_json::Value::as_i64).ok_or_else(|| err("missing variantId".to_string()))?),
                    amount: data.get("amount").and_then(serde_json::Value::as_i64).ok_or_else(|| err("missing amount".to_string()))? as i32,
                    request_id: data.get("requestId").and_then(serde_json::Value::as_i64).ok_or_else(|| err("missing requestId".to_string()))?,
                }),
                "cancel" => Ok(CartInboundEvent::ReservationCancel { transaction_id }),
                "prolong" => Ok(CartInboundEvent::ReservationProlong { transaction_id }),
                "confirm" => Ok(CartInboundEvent::ReservationConfirm {
                    transaction_id,
                    pickup_code: data.get("pickupCode").and_then(serde_json::Value::as_str).ok_or_else(|| err("missing pickupCode".to_string()))?.to_string(),
                }),
                other => Err(err(format!("unknown updateType '{other}'"))),
            }
        }
        "transaction" => {
            let transaction_id = TransactionId(
                data.get("transactionId").and_then(serde_json::Value::as_str).ok_or_else(|| err("missing transactionId".to_string()))?.to_string(),
            );
            let status = data.get("status").and_then(serde_json::Value::as_str).ok_or_else(|| err("missing status".to_string()))?;
            Ok(CartInboundEvent::TransactionUpdate { transaction_id, success: status == "PAYMENT_SUCCESS" })
        }
        other => Err(err(format!("unsupported topic '{other}'"))),
    }
}

/// Cart & reservation engine state, owned by the worker task (C5).
pub struct CartEngine {
    bus: EventBus,
    cloud: Arc<dyn CloudClient>,
    repo: Arc<dyn Repository>,
    expiration_window: Duration,
    prereservation_window: Duration,
    reservation_window: Duration,
    order_history_window: Duration,
    short_list: Mutex<Vec<ExpirationItem<CartId>>>,
    reservation_list: Mutex<Vec<ExpirationItem<CartId>>>,
    order_hist_list: Mutex<Vec<ExpirationItem<OrderHistoryId>>>,
    pending_dispensing: Mutex<Vec<PendingDispensing>>,
    machine_busy: Mutex<bool>,
    tx: mpsc::UnboundedSender<CartCommand>,
}

/// Handle to the running engine: the direct-call API, serialized through
/// the worker's command queue (SPEC_FULL.md §4.4 open question 2).
#[derive(Clone)]
pub struct CartEngineHandle {
    tx: mpsc::UnboundedSender<CartCommand>,
    bus: EventBus,
}

impl CartEngine {
    pub fn new(bus: EventBus, cloud: Arc<dyn CloudClient>, repo: Arc<dyn Repository>, config: &Config) -> (Arc<Self>, CartEngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            bus: bus.clone(),
            cloud,
            repo,
            expiration_window: Duration::from_secs(config.timers.checkout_window_secs),
            prereservation_window: Duration::from_secs(config.timers.prereservation_window_secs),
            reservation_window: Duration::from_secs(config.timers.reservation_window_secs),
            order_history_window: Duration::from_secs(config.timers.order_history_window_secs),
            short_list: Mutex::new(Vec::new()),
            reservation_list: Mutex::new(Vec::new()),
            order_hist_list: Mutex::new(Vec::new()),
            pending_dispensing: Mutex::new(Vec::new()),
            machine_busy: Mutex::new(false),
            tx: tx.clone(),
        });
        engine.clone().spawn_worker(rx);
        let handle = CartEngineHandle { tx, bus };
        (engine, handle)
    }

    fn spawn_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<CartCommand>) {
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                self.handle_command(cmd).await;
            }
        });
    }

    /// Wire bus subscriptions for `PLANOGRAM_UPDATE_DONE`, `PURCHASE_FINISHED`
    /// and `BEGIN_TRANSACTION_REQUEST` (spec.md §4.4).
    pub async fn subscribe(self: &Arc<Self>) {
        let tx = self.tx.clone();
        self.bus
            .subscribe(
                "PLANOGRAM_UPDATE_DONE",
                Arc::new(move |_: &Event| {
                    let _ = tx.send(CartCommand::PlanogramWasUpdated);
                }),
            )
            .await;

        let tx = self.tx.clone();
        self.bus
            .subscribe(
                "PURCHASE_FINISHED",
                Arc::new(move |event: &Event| {
                    if let EventKind::PurchaseFinished { cart_id } = event.kind() {
                        let _ = tx.send(CartCommand::PurchaseFinished { cart_id: *cart_id });
                    }
                }),
            )
            .await;

        let tx = self.tx.clone();
        self.bus
            .subscribe(
                "BEGIN_TRANSACTION_REQUEST",
                Arc::new(move |event: &Event| {
                    if let EventKind::BeginTransactionRequest { cart_id } = event.kind() {
                        let _ = tx.send(CartCommand::BeginTransaction { cart_id: *cart_id });
                    }
                }),
            )
            .await;

        let tx = self.tx.clone();
        self.bus
            .subscribe(
                "MACHINE_STATE_CHANGED",
                Arc::new(move |event: &Event| {
                    if let EventKind::MachineStateChanged { state } = event.kind() {
                        let _ = tx.send(CartCommand::MachineStateChanged { state: *state });
                    }
                }),
            )
            .await;
    }

    /// Route an already-parsed inbound IoT notification onto the worker
    /// (spec.md §4.4, "Remote cart inbound protocol").
    pub fn on_inbound(&self, event: CartInboundEvent) {
        let cmd = match event {
            CartInboundEvent::ReservationUpdate { transaction_id, variant_id, amount, request_id } => {
                CartCommand::ReservationRequestUpdate { transaction_id, variant_id, amount, request_id }
            }
            CartInboundEvent::ReservationCancel { transaction_id } => CartCommand::ReservationRequestCancel { transaction_id },
            CartInboundEvent::ReservationProlong { transaction_id } => CartCommand::ReservationRequestProlong { transaction_id },
            CartInboundEvent::ReservationConfirm { transaction_id, pickup_code } => {
                CartCommand::ReservationRequestConfirm { transaction_id, pickup_code }
            }
            CartInboundEvent::TransactionUpdate { transaction_id, success } => CartCommand::TransactionCompleted { transaction_id, success },
        };
        let _ = self.tx.send(cmd);
    }

    async fn handle_command(&self, cmd: CartCommand) {
        match cmd {
            CartCommand::Update { transaction_id, display_id, cart_type, variant_id, amount, reply } => {
                let result = self.update(transaction_id, display_id, cart_type, variant_id, amount).await;
                let _ = reply.send(result);
            }
            CartCommand::Clear { transaction_id, reply } => {
                let result = self.clear(transaction_id).await;
                let _ = reply.send(result);
            }
            CartCommand::Prolong { transaction_id, reply } => {
                let result = self.prolong(transaction_id).await;
                let _ = reply.send(result);
            }
            CartCommand::Reserve { transaction_id, order_info, reply } => {
                let result = self.reserve(transaction_id, order_info).await;
                let _ = reply.send(result);
            }
            CartCommand::Dispense { transaction_id, display_id, reply } => {
                let result = self.dispense(transaction_id, display_id).await;
                let _ = reply.send(result);
            }
            CartCommand::BeginTransaction { cart_id } => self.begin_transaction(cart_id).await,
            CartCommand::TransactionCompleted { transaction_id, success } => {
                if success {
                    let _ = self.dispense(transaction_id, 0).await;
                } else {
                    let _ = self.clear(transaction_id).await;
                }
            }
            CartCommand::ReservationRequestUpdate { transaction_id, variant_id, amount, request_id } => {
                self.process_reservation_update(transaction_id, variant_id, amount, request_id).await;
            }
            CartCommand::ReservationRequestCancel { transaction_id } => {
                let _ = self.clear(transaction_id).await;
            }
            CartCommand::ReservationRequestProlong { transaction_id } => {
                let _ = self.prolong(transaction_id).await;
            }
            CartCommand::ReservationRequestConfirm { transaction_id, pickup_code } => {
                let _ = self.reserve(transaction_id, pickup_code).await;
            }
            CartCommand::PlanogramWasUpdated => self.handle_planogram_updated().await,
            CartCommand::PurchaseFinished { cart_id } => self.process_purchase_finished(cart_id).await,
            CartCommand::MachineStateChanged { state } => self.handle_machine_state_changed(state).await,
            CartCommand::ProcessPendingReservations(item) => self.process_pending_reservations(item).await,
        }
    }

    fn cancel_cart_expiration(list: &mut Vec<ExpirationItem<CartId>>, cart_id: CartId) {
        list.retain(|item| item.id != cart_id);
    }

    /// Remove a cart along with every cart item and reservation it owns
    /// (spec.md §8 invariant 3: a removed cart leaves no surviving
    /// reservations or cart items).
    async fn delete_cart_fully(&self, cart_id: CartId) -> Result<(), DbError> {
        for item in self.repo.list_cart_items(cart_id).await? {
            self.repo.delete_cart_item(cart_id, item.variant_id).await?;
        }
        for reservation in self.repo.list_reservations_for_cart(cart_id).await? {
            self.repo.delete_reservation(reservation.id).await?;
        }
        self.repo.delete_cart(cart_id).await
    }

    async fn set_prereservation_timer(&self, cart_id: CartId, restart: bool) {
        let mut list = self.short_list.lock().await;
        if restart {
            Self::cancel_cart_expiration(&mut list, cart_id);
        }
        list.push(ExpirationItem { id: cart_id, deadline: Instant::now() + self.prereservation_window });
    }

    /// `stock - reserved >= amount` gate, then greedy per-slot consumption
    /// in storage order (spec.md §4.4, "Reservation arithmetic").
    async fn do_reservation(&self, cart_id: CartId, variant_id: VariantId, mut amount: i32) -> Result<bool, DbError> {
        let inv_items: Vec<_> = self
            .repo
            .list_inventory_slots()
            .await?
            .into_iter()
            .filter(|slot| slot.variant_id == variant_id)
            .collect();
        let stock: i32 = inv_items.iter().map(|slot| slot.quantity).sum();
        let all_reservations: Vec<_> = self
            .repo
            .list_reservations()
            .await?
            .into_iter()
            .filter(|r| r.variant_id == variant_id)
            .collect();
        let reserved: i32 = all_reservations.iter().map(|r| r.quantity).sum();

        if stock == 0 || stock - reserved < amount {
            return Ok(false);
        }

        for slot in &inv_items {
            let already_reserved: i32 = all_reservations
                .iter()
                .filter(|r| r.unit_id == slot.unit_id && r.location == slot.location)
                .map(|r| r.quantity)
                .sum();
            let free = slot.quantity - already_reserved;
            if free <= 0 {
                continue;
            }
            let take = free.min(amount);
            self.add_or_merge_reservation(cart_id, variant_id, slot.unit_id, slot.location, take).await?;
            amount -= take;
            if amount <= 0 {
                break;
            }
        }
        Ok(true)
    }

    async fn add_or_merge_reservation(&self, cart_id: CartId, variant_id: VariantId, unit_id: UnitId, location: Location, amount: i32) -> Result<(), DbError> {
        let existing = self
            .repo
            .list_reservations_for_cart(cart_id)
            .await?
            .into_iter()
            .find(|r| r.variant_id == variant_id && r.unit_id == unit_id && r.location == location);
        match existing {
            Some(mut r) => {
                r.quantity += amount;
                self.repo.update_reservation(&r).await?;
            }
            None => {
                self.repo
                    .create_reservation(&Reservation {
                        id: crate::model::ReservationId(0),
                        cart_id,
                        variant_id,
                        unit_id,
                        location,
                        quantity: amount,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Cancel `amount` of `variant_id` from `cart_id`'s reservations, in
    /// storage order (spec.md §4.4).
    async fn cancel_reservation(&self, cart_id: CartId, variant_id: VariantId, mut amount: i32) -> Result<(), DbError> {
        let reservations: Vec<_> = self
            .repo
            .list_reservations_for_cart(cart_id)
            .await?
            .into_iter()
            .filter(|r| r.variant_id == variant_id)
            .collect();
        for mut r in reservations {
            if amount <= 0 {
                break;
            }
            if r.quantity <= amount {
                self.repo.delete_reservation(r.id).await?;
                amount -= r.quantity;
            } else {
                r.quantity -= amount;
                self.repo.update_reservation(&r).await?;
                amount = 0;
            }
        }
        Ok(())
    }

    async fn update(&self, transaction_id: TransactionId, display_id: i32, cart_type: CartType, variant_id: VariantId, amount: i32) -> (OperationResult, String) {
        debug!(transaction_id = %transaction_id.0, "handling cart update");
        if amount == 0 {
            warn!("requested cart update with zero amount");
            return (OperationResult::Error, "Amount cannot be 0".to_string());
        }

        let existing = match self.repo.get_cart_by_transaction(&transaction_id).await {
            Ok(c) => c,
            Err(_) => return (OperationResult::Error, "Internal error".to_string()),
        };
        let (cart, is_new_cart) = match existing {
            Some(cart) => (cart, false),
            None => {
                let status = if cart_type == CartType::Local { CartStatus::Created } else { CartStatus::Prereservation };
                let new_cart = Cart {
                    id: CartId(0),
                    display_id,
                    transaction_id: transaction_id.clone(),
                    cart_type,
                    order_info: String::new(),
                    status,
                    checkout_method: CheckoutMethod::Undefined,
                    locked_at: now_unix(),
                };
                let id = match self.repo.create_cart(&new_cart).await {
                    Ok(id) => id,
                    Err(_) => return (OperationResult::Error, "Internal error".to_string()),
                };
                let cart = Cart { id, ..new_cart };
                if cart.status == CartStatus::Prereservation {
                    self.set_prereservation_timer(cart.id, false).await;
                }
                (cart, true)
            }
        };

        let items = match self.repo.list_cart_items(cart.id).await {
            Ok(items) => items,
            Err(_) => return (OperationResult::Error, "Internal error".to_string()),
        };
        let existing_item = items.into_iter().find(|item| item.variant_id == variant_id);

        let mut result = (OperationResult::Ok, String::new());
        match existing_item {
            Some(mut item) => {
                if amount > 0 {
                    match self.do_reservation(cart.id, variant_id, amount).await {
                        Ok(true) => {
                            item.amount += amount;
                            let _ = self.repo.upsert_cart_item(&item).await;
                        }
                        Ok(false) => result = (OperationResult::Nok, String::new()),
                        Err(_) => result = (OperationResult::Error, "Internal error".to_string()),
                    }
                } else {
                    let abs_amount = amount.abs();
                    if item.amount >= abs_amount {
                        if self.cancel_reservation(cart.id, variant_id, abs_amount).await.is_err() {
                            result = (OperationResult::Error, "Internal error".to_string());
                        } else if item.amount - abs_amount > 0 {
                            item.amount -= abs_amount;
                            let _ = self.repo.upsert_cart_item(&item).await;
                        } else {
                            let _ = self.repo.delete_cart_item(cart.id, variant_id).await;
                        }
                    } else {
                        result = (OperationResult::Error, format!("Requested amount {abs_amount} is more than reserved"));
                    }
                }
            }
            None => {
                if amount > 0 {
                    match self.do_reservation(cart.id, variant_id, amount).await {
                        Ok(true) => {
                            let _ = self.repo.upsert_cart_item(&CartItem { cart_id: cart.id, variant_id, amount }).await;
                        }
                        Ok(false) => result = (OperationResult::Nok, String::new()),
                        Err(_) => result = (OperationResult::Error, "Internal error".to_string()),
                    }
                } else {
                    result = (OperationResult::Error, "Cannot remove not yet added items".to_string());
                }
            }
        }

        if !is_new_cart && cart.status == CartStatus::Prereservation && result.0 == OperationResult::Ok {
            self.set_prereservation_timer(cart.id, true).await;
        }
        result
    }

    async fn clear(&self, transaction_id: TransactionId) -> (OperationResult, String) {
        debug!(transaction_id = %transaction_id.0, "handling cart clear");
        let cart = match self.repo.get_cart_by_transaction(&transaction_id).await {
            Ok(Some(cart)) => cart,
            Ok(None) => {
                warn!(transaction_id = %transaction_id.0, "clear requested but cart does not exist");
                return (OperationResult::Error, "Cart is not found".to_string());
            }
            Err(_) => return (OperationResult::Error, "Internal error".to_string()),
        };
        Self::cancel_cart_expiration(&mut *self.short_list.lock().await, cart.id);
        if cart.cart_type == CartType::Remote {
            Self::cancel_cart_expiration(&mut *self.reservation_list.lock().await, cart.id);
        }
        let _ = self.delete_cart_fully(cart.id).await;
        (OperationResult::Ok, String::new())
    }

    async fn prolong(&self, transaction_id: TransactionId) -> (OperationResult, String) {
        debug!(transaction_id = %transaction_id.0, "handling cart prolong");
        let cart = match self.repo.get_cart_by_transaction(&transaction_id).await {
            Ok(Some(cart)) => cart,
            Ok(None) => return (OperationResult::Error, "Cart is not found".to_string()),
            Err(_) => return (OperationResult::Error, "Internal error".to_string()),
        };
        if cart.cart_type == CartType::Remote && cart.status == CartStatus::Prereservation {
            self.set_prereservation_timer(cart.id, true).await;
            (OperationResult::Ok, String::new())
        } else {
            warn!(cart_id = cart.id.0, "prolong requested for wrong cart type or state");
            (OperationResult::Error, "Wrong cart type or state to prolong".to_string())
        }
    }

    async fn reserve(&self, transaction_id: TransactionId, order_info: String) -> (OperationResult, String) {
        debug!(transaction_id = %transaction_id.0, "handling cart reserve");
        let mut cart = match self.repo.get_cart_by_transaction(&transaction_id).await {
            Ok(Some(cart)) => cart,
            Ok(None) => return (OperationResult::Error, "Cart is not found".to_string()),
            Err(_) => return (OperationResult::Error, "Internal error".to_string()),
        };
        if cart.cart_type != CartType::Remote {
            warn!(cart_id = cart.id.0, "reserve requested for non-remote cart");
            return (OperationResult::Error, "Wrong cart type to reserve".to_string());
        }
        Self::cancel_cart_expiration(&mut *self.short_list.lock().await, cart.id);
        cart.order_info = order_info;
        cart.checkout_method = CheckoutMethod::Pickup;
        cart.status = CartStatus::Reserved;
        cart.locked_at = now_unix();
        if self.repo.update_cart(&cart).await.is_err() {
            return (OperationResult::Error, "Internal error".to_string());
        }
        self.reservation_list.lock().await.push(ExpirationItem { id: cart.id, deadline: Instant::now() + self.reservation_window });
        (OperationResult::Ok, String::new())
    }

    async fn dispense(&self, transaction_id: TransactionId, display_id: i32) -> (OperationResult, String) {
        debug!(transaction_id = %transaction_id.0, "handling cart dispense");
        let cart = match self.repo.get_cart_by_transaction(&transaction_id).await {
            Ok(Some(cart)) => cart,
            Ok(None) => return (OperationResult::Error, "Cart is not found".to_string()),
            Err(_) => return (OperationResult::Error, "Internal error".to_string()),
        };
        let items = match self.repo.list_cart_items(cart.id).await {
            Ok(items) => items,
            Err(_) => return (OperationResult::Error, "Internal error".to_string()),
        };
        if items.is_empty() {
            warn!(cart_id = cart.id.0, "dispense requested for empty cart");
            return (OperationResult::Error, "Cart is empty".to_string());
        }

        if *self.machine_busy.lock().await {
            debug!(cart_id = cart.id.0, "machine busy, queuing dispense request");
            self.pending_dispensing.lock().await.push(PendingDispensing { transaction_id, display_id });
            return (OperationResult::Pending, String::new());
        }

        self.begin_dispensing(cart, display_id).await
    }

    /// Hardware integration itself is out of scope (spec.md Non-goals); this
    /// marks the cart `DISPENSING` and cancels its pending expirations,
    /// which is the full extent of what C5 owns once the machine is free
    /// to accept the request.
    async fn begin_dispensing(&self, mut cart: Cart, display_id: i32) -> (OperationResult, String) {
        Self::cancel_cart_expiration(&mut *self.short_list.lock().await, cart.id);
        if cart.cart_type == CartType::Remote {
            Self::cancel_cart_expiration(&mut *self.reservation_list.lock().await, cart.id);
            cart.display_id = display_id;
        }
        cart.status = CartStatus::Dispensing;
        if self.repo.update_cart(&cart).await.is_err() {
            return (OperationResult::Error, "Internal error".to_string());
        }
        (OperationResult::Ok, String::new())
    }

    async fn handle_machine_state_changed(&self, state: MachineState) {
        let was_busy = {
            let mut busy = self.machine_busy.lock().await;
            let was_busy = *busy;
            *busy = state == MachineState::Busy;
            was_busy
        };
        if was_busy && state != MachineState::Busy {
            let next = {
                let mut pending = self.pending_dispensing.lock().await;
                if pending.is_empty() {
                    None
                } else {
                    Some(pending.remove(0))
                }
            };
            if let Some(item) = next {
                let _ = self.tx.send(CartCommand::ProcessPendingReservations(item));
            }
        }
    }

    /// POSTs cart contents to the `transaction` cloud API, updates the
    /// cart to CHECKOUT, starts its expiration timer (spec.md §4.4).
    async fn begin_transaction(&self, cart_id: CartId) {
        let respond_failure = || async {
            self.bus.post(Event::new(EventKind::BeginTransactionResponse { cart_id, success: false })).await;
        };

        let mut cart = match self.repo.get_cart(cart_id).await {
            Ok(Some(cart)) => cart,
            Ok(None) => {
                error!(cart_id = cart_id.0, "begin_transaction: cart not found");
                respond_failure().await;
                return;
            }
            Err(e) => {
                error!(error = %e, "begin_transaction: db error");
                respond_failure().await;
                return;
            }
        };
        let items = match self.repo.list_cart_items(cart_id).await {
            Ok(items) if !items.is_empty() => items,
            _ => {
                error!(cart_id = cart_id.0, "begin_transaction: cart is empty");
                respond_failure().await;
                return;
            }
        };

        let body = serde_json::json!({
            "deviceId": "",
            "products": items.iter().map(|item| serde_json::json!({"id": item.variant_id.0, "qty": item.amount})).collect::<Vec<_>>(),
        });

        match self.cloud.post("transaction", "", None, body).await {
            Ok(response) => match response.get("transactionId").and_then(serde_json::Value::as_str) {
                Some(transaction_id) => {
                    cart.transaction_id = TransactionId(transaction_id.to_string());
                    cart.status = CartStatus::Checkout;
                    cart.locked_at = now_unix();
                    if self.repo.update_cart(&cart).await.is_err() {
                        respond_failure().await;
                        return;
                    }
                    self.short_list.lock().await.push(ExpirationItem { id: cart_id, deadline: Instant::now() + self.expiration_window });
                    self.bus.post(Event::new(EventKind::BeginTransactionResponse { cart_id, success: true })).await;
                }
                None => {
                    error!(cart_id = cart_id.0, "begin_transaction: response missing transactionId");
                    respond_failure().await;
                }
            },
            Err(e) => {
                // Soft failure: no automatic retry loop, only retried on
                // the next external BEGIN_TRANSACTION_REQUEST (spec.md §7).
                warn!(error = %e, cart_id = cart_id.0, "begin_transaction: cloud POST failed");
                respond_failure().await;
            }
        }
    }

    async fn process_reservation_update(&self, transaction_id: TransactionId, variant_id: VariantId, amount: i32, request_id: i64) {
        let (result, _) = self.update(transaction_id.clone(), 0, CartType::Remote, variant_id, amount).await;
        let body = serde_json::json!({
            "deviceId": "",
            "transactionId": transaction_id.0,
            "requestId": request_id,
            "result": result == OperationResult::Ok,
        });
        if let Err(e) = self.cloud.post("prereservation", "", None, body).await {
            error!(error = %e, "failed to post prereservation response");
        }
    }

    /// Planogram-change relocation (spec.md §4.4): two-pass algorithm that
    /// reassigns reservations whose slot disappeared to another
    /// still-existing slot of the same variant within the same unit.
    async fn handle_planogram_updated(&self) {
        let Ok(carts) = self.repo.list_carts().await else { return };
        let Ok(all_slots) = self.repo.list_inventory_slots().await else { return };

        let mut var_locations: HashMap<VariantId, HashMap<UnitId, Vec<Location>>> = HashMap::new();
        for slot in &all_slots {
            var_locations.entry(slot.variant_id).or_default().entry(slot.unit_id).or_default().push(slot.location);
        }

        for cart in carts {
            let Ok(items) = self.repo.list_cart_items(cart.id).await else { continue };
            for item in items {
                let variant_id = item.variant_id;
                let locations_by_unit = var_locations.entry(variant_id).or_default();
                let Ok(reservations) = self.repo.list_reservations_for_cart(cart.id).await else { continue };
                let reservations: Vec<_> = reservations.into_iter().filter(|r| r.variant_id == variant_id).collect();

                let mut used_locations = Vec::new();
                for r in &reservations {
                    match locations_by_unit.get(&r.unit_id) {
                        None => {
                            error!(variant_id = variant_id.0, unit_id = r.unit_id.0, "reservations and inventory are out of sync");
                        }
                        Some(locations) => {
                            if locations.contains(&r.location) {
                                used_locations.push(r.location);
                            }
                        }
                    }
                }

                for r in &reservations {
                    let still_exists = locations_by_unit.get(&r.unit_id).map(|locs| locs.contains(&r.location)).unwrap_or(false);
                    if still_exists {
                        continue;
                    }
                    let Some(locations) = locations_by_unit.get(&r.unit_id) else { continue };
                    let replacement = locations.iter().find(|loc| !used_locations.contains(loc)).copied();
                    match replacement {
                        Some(new_location) => {
                            let mut updated = *r;
                            updated.location = new_location;
                            let _ = self.repo.update_reservation(&updated).await;
                            used_locations.push(new_location);
                            debug!(variant_id = variant_id.0, cart_id = cart.id.0, from = r.location.0, to = new_location.0, "relocated reservation");
                        }
                        None => {
                            error!(variant_id = variant_id.0, cart_id = cart.id.0, unit_id = r.unit_id.0, location = r.location.0, "failed to relocate reserved variant: no free slot");
                        }
                    }
                }
            }
        }
    }

    async fn process_purchase_finished(&self, cart_id: CartId) {
        debug!(cart_id = cart_id.0, "processing purchase finished");
        match self.repo.get_cart(cart_id).await {
            Ok(Some(cart)) => {
                if cart.cart_type == CartType::Remote {
                    self.bus
                        .post(Event::new(EventKind::ReservationCompleted { transaction_id: cart.transaction_id.clone(), status: CompletionStatus::Dispensed }))
                        .await;
                    self.record_order_history(&cart, CompletionStatus::Dispensed).await;
                }
                let _ = self.delete_cart_fully(cart.id).await;
            }
            Ok(None) => warn!(cart_id = cart_id.0, "purchase finished but cart not found"),
            Err(e) => error!(error = %e, "db error processing purchase finished"),
        }
    }

    /// Retry a dispense that was queued while the machine was `BUSY`
    /// (spec.md §4.4). If it's still busy by the time this runs, the
    /// request goes back on the queue for the next `MACHINE_STATE_CHANGED`.
    async fn process_pending_reservations(&self, pending: PendingDispensing) {
        debug!(transaction_id = %pending.transaction_id.0, "processing pending dispense request");
        if *self.machine_busy.lock().await {
            self.pending_dispensing.lock().await.push(pending);
            return;
        }
        match self.repo.get_cart_by_transaction(&pending.transaction_id).await {
            Ok(Some(cart)) => {
                let _ = self.begin_dispensing(cart, pending.display_id).await;
            }
            Ok(None) => error!(transaction_id = %pending.transaction_id.0, "pending cart no longer exists"),
            Err(e) => error!(error = %e, "db error processing pending dispense request"),
        }
    }

    async fn record_order_history(&self, cart: &Cart, status: CompletionStatus) {
        let record = OrderHistoryRecord {
            id: OrderHistoryId(0),
            transaction_id: cart.transaction_id.clone(),
            order_info: cart.order_info.clone(),
            completion_status: status,
            created_at: now_unix(),
        };
        if let Ok(id) = self.repo.create_order_history(&record).await {
            self.order_hist_list.lock().await.push(ExpirationItem { id, deadline: Instant::now() + self.order_history_window });
        }
    }

    /// Rebuild the three timer lists from persisted carts/order-history at
    /// startup (spec.md §4.4, "Recovery on startup").
    pub async fn recover_on_startup(&self) -> Result<(), DbError> {
        let carts = self.repo.list_carts().await?;
        let now = now_unix();
        for cart in carts {
            let elapsed = Duration::from_secs((now - cart.locked_at).max(0) as u64);
            if cart.cart_type == CartType::Remote && cart.status == CartStatus::Reserved && elapsed < self.reservation_window {
                let remaining = self.reservation_window - elapsed;
                self.reservation_list.lock().await.push(ExpirationItem { id: cart.id, deadline: Instant::now() + remaining });
                debug!(cart_id = cart.id.0, "reservation expiration recovered");
            } else if cart.status == CartStatus::Checkout && elapsed < self.expiration_window {
                let remaining = self.expiration_window - elapsed;
                self.short_list.lock().await.push(ExpirationItem { id: cart.id, deadline: Instant::now() + remaining });
                debug!(cart_id = cart.id.0, "checkout expiration recovered");
            } else {
                self.delete_cart_fully(cart.id).await?;
                debug!(cart_id = cart.id.0, "obsolete cart cleared at startup");
            }
        }

        let records = self.repo.list_order_history().await?;
        for record in records {
            let elapsed = Duration::from_secs((now - record.created_at).max(0) as u64);
            if elapsed < self.order_history_window {
                let remaining = self.order_history_window - elapsed;
                self.order_hist_list.lock().await.push(ExpirationItem { id: record.id, deadline: Instant::now() + remaining });
            } else {
                self.repo.delete_order_history(record.id).await?;
            }
        }
        Ok(())
    }

    /// Sweep all three timer lists. Runs on its own periodic task,
    /// independent of the command worker (spec.md §4.4: "A periodic task
    /// sweeps the short list every tick and the long lists every 12
    /// ticks").
    pub async fn sweep_short(&self) {
        let now = Instant::now();
        let mut expired_short = Vec::new();
        {
            let mut list = self.short_list.lock().await;
            list.retain(|item| {
                if item.deadline <= now {
                    expired_short.push(item.id);
                    false
                } else {
                    true
                }
            });
        }
        for cart_id in expired_short {
            match self.repo.get_cart(cart_id).await {
                Ok(Some(cart)) => {
                    if cart.status == CartStatus::Prereservation {
                        self.bus
                            .post(Event::new(EventKind::ReservationCompleted { transaction_id: cart.transaction_id.clone(), status: CompletionStatus::Expired }))
                            .await;
                    }
                    let _ = self.delete_cart_fully(cart.id).await;
                    debug!(cart_id = cart.id.0, "cart expired and cleared");
                }
                Ok(None) => warn!(cart_id = cart_id.0, "expired cart missing from db"),
                Err(e) => error!(error = %e, "db error sweeping short timers"),
            }
        }
    }

    pub async fn sweep_long(&self) {
        let now = Instant::now();

        let mut expired_reservation = Vec::new();
        {
            let mut list = self.reservation_list.lock().await;
            list.retain(|item| {
                if item.deadline <= now {
                    expired_reservation.push(item.id);
                    false
                } else {
                    true
                }
            });
        }
        for cart_id in expired_reservation {
            match self.repo.get_cart(cart_id).await {
                Ok(Some(cart)) => {
                    self.bus
                        .post(Event::new(EventKind::ReservationCompleted { transaction_id: cart.transaction_id.clone(), status: CompletionStatus::Expired }))
                        .await;
                    self.record_order_history(&cart, CompletionStatus::Expired).await;
                    let _ = self.delete_cart_fully(cart.id).await;
                    debug!(cart_id = cart.id.0, "remote cart reservation expired and cleared");
                }
                Ok(None) => warn!(cart_id = cart_id.0, "expired remote cart missing from db"),
                Err(e) => error!(error = %e, "db error sweeping reservation timers"),
            }
        }

        let mut expired_history = Vec::new();
        {
            let mut list = self.order_hist_list.lock().await;
            list.retain(|item| {
                if item.deadline <= now {
                    expired_history.push(item.id);
                    false
                } else {
                    true
                }
            });
        }
        for record_id in expired_history {
            let _ = self.repo.delete_order_history(record_id).await;
            debug!(record_id = record_id.0, "order history record expired and cleared");
        }
    }

    /// Spawn the periodic sweep task (default 5s short tick, 12 ticks ≈
    /// 1 minute for the long lists).
    pub fn spawn_sweep(self: Arc<Self>, tick: Duration) -> tokio::task::JoinHandle<()> {
        const LONG_TICKS: u32 = 12;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            let mut tick_count: u32 = 0;
            loop {
                ticker.tick().await;
                self.sweep_short().await;
                tick_count += 1;
                if tick_count >= LONG_TICKS {
                    tick_count = 0;
                    self.sweep_long().await;
                }
            }
        })
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

impl CartEngineHandle {
    pub async fn update(&self, transaction_id: TransactionId, display_id: i32, cart_type: CartType, variant_id: VariantId, amount: i32) -> (OperationResult, String) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(CartCommand::Update { transaction_id, display_id, cart_type, variant_id, amount, reply: reply_tx })
            .is_err()
        {
            return (OperationResult::Error, "engine is not running".to_string());
        }
        reply_rx.await.unwrap_or((OperationResult::Error, "engine is not running".to_string()))
    }

    pub async fn clear(&self, transaction_id: TransactionId) -> (OperationResult, String) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(CartCommand::Clear { transaction_id, reply: reply_tx }).is_err() {
            return (OperationResult::Error, "engine is not running".to_string());
        }
        reply_rx.await.unwrap_or((OperationResult::Error, "engine is not running".to_string()))
    }

    pub async fn prolong(&self, transaction_id: TransactionId) -> (OperationResult, String) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(CartCommand::Prolong { transaction_id, reply: reply_tx }).is_err() {
            return (OperationResult::Error, "engine is not running".to_string());
        }
        reply_rx.await.unwrap_or((OperationResult::Error, "engine is not running".to_string()))
    }

    pub async fn reserve(&self, transaction_id: TransactionId, order_info: String) -> (OperationResult, String) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(CartCommand::Reserve { transaction_id, order_info, reply: reply_tx }).is_err() {
            return (OperationResult::Error, "engine is not running".to_string());
        }
        reply_rx.await.unwrap_or((OperationResult::Error, "engine is not running".to_string()))
    }

    pub async fn dispense(&self, transaction_id: TransactionId, display_id: i32) -> (OperationResult, String) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(CartCommand::Dispense { transaction_id, display_id, reply: reply_tx }).is_err() {
            return (OperationResult::Error, "engine is not running".to_string());
        }
        reply_rx.await.unwrap_or((OperationResult::Error, "engine is not running".to_string()))
    }

    /// Post `BEGIN_TRANSACTION_REQUEST` and await `BEGIN_TRANSACTION_RESPONSE`
    /// for the same cart, resolving SPEC_FULL.md §4.4 open question 4 (the
    /// UI needs a synchronous-looking wait over an async event round trip).
    pub async fn begin_transaction_and_await(&self, cart_id: CartId, wait: Duration) -> Result<bool, KioskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let reply_tx = Arc::new(Mutex::new(Some(reply_tx)));
        let waiting_for = cart_id;
        self.bus
            .subscribe(
                "BEGIN_TRANSACTION_RESPONSE",
                Arc::new(move |event: &Event| {
                    if let EventKind::BeginTransactionResponse { cart_id, success } = event.kind() {
                        if *cart_id == waiting_for {
                            if let Ok(mut slot) = reply_tx.try_lock() {
                                if let Some(sender) = slot.take() {
                                    let _ = sender.send(*success);
                                }
                            }
                        }
                    }
                }),
            )
            .await;
        self.bus.post(Event::new(EventKind::BeginTransactionRequest { cart_id })).await;

        match timeout(wait, reply_rx).await {
            Ok(Ok(success)) => Ok(success),
            Ok(Err(_)) => Err(KioskError::Timeout),
            Err(_) => Err(KioskError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inbound_reservation_update() {
        let payload = br#"{"transactionId":"T1","updateType":"update","variantId":5,"amount":2,"requestId":9}"#;
        let event = parse_inbound("reservation", payload).unwrap();
        assert_eq!(
            event,
            CartInboundEvent::ReservationUpdate {
                transaction_id: TransactionId("T1".to_string()),
                variant_id: VariantId(5),
                amount: 2,
                request_id: 9,
            }
        );
    }

    #[test]
    fn parse_inbound_reservation_cancel() {
        let payload = br#"{"transactionId":"T1","updateType":"cancel"}"#;
        let event = parse_inbound("reservation", payload).unwrap();
        assert_eq!(event, CartInboundEvent::ReservationCancel { transaction_id: TransactionId("T1".to_string()) });
    }

    #[test]
    fn parse_inbound_transaction_success() {
        let payload = br#"{"transactionId":"T1","status":"PAYMENT_SUCCESS"}"#;
        let event = parse_inbound("transaction", payload).unwrap();
        assert_eq!(event, CartInboundEvent::TransactionUpdate { transaction_id: TransactionId("T1".to_string()), success: true });
    }

    #[test]
    fn parse_inbound_transaction_failure() {
        let payload = br#"{"transactionId":"T1","status":"PAYMENT_FAILED"}"#;
        let event = parse_inbound("transaction", payload).unwrap();
        assert_eq!(event, CartInboundEvent::TransactionUpdate { transaction_id: TransactionId("T1".to_string()), success: false });
    }

    #[test]
    fn parse_inbound_rejects_malformed_payload() {
        assert!(parse_inbound("reservation", b"not json").is_err());
    }
}
