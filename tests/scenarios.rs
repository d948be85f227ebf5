//! End-to-end scenario tests, transcribed from the literal S1-S6 walkthroughs
//! and the universal invariants (spec.md §8). Each test wires the real
//! `SqliteRepository` against a temp-file database (no mocks for storage;
//! only the cloud client is faked, since the cloud is an external system).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use kiosk_core::bus::{Event, EventBus, EventKind};
use kiosk_core::cart::CartEngine;
use kiosk_core::cloud::CloudClient;
use kiosk_core::config::Config;
use kiosk_core::error::CloudError;
use kiosk_core::machine::{MachineFsm, MachineState};
use kiosk_core::model::{
    CartStatus, CartType, InventorySlot, Location, OperationResult, TransactionId, TrayNumber,
    UnitId, VariantId,
};
use kiosk_core::planogram::PlanogramSynchronizer;
use kiosk_core::repository::{Repository, SqliteRepository};

/// A cloud double that answers `transaction` POSTs with a fixed id and
/// everything else with an empty object; no test here drives the
/// planogram/product/collection GET paths, so those are never asked for.
struct MockCloudClient {
    transaction_id: String,
}

#[async_trait]
impl CloudClient for MockCloudClient {
    async fn get(&self, _api: &str, _device_id: &str, _customer_id: Option<&str>) -> Result<Value, CloudError> {
        Ok(Value::Null)
    }

    async fn post(&self, api: &str, _device_id: &str, _customer_id: Option<&str>, _body: Value) -> Result<Value, CloudError> {
        if api == "transaction" {
            Ok(serde_json::json!({ "transactionId": self.transaction_id }))
        } else {
            Ok(serde_json::json!({}))
        }
    }

    async fn download_image(&self, _media_id: &str, _dest: &Path) -> Result<u64, CloudError> {
        Ok(0)
    }
}

async fn test_repo() -> Arc<dyn Repository> {
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    let options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(file.path())
        .create_if_missing(true);
    let pool = sqlx::sqlite::SqlitePoolOptions::new().connect_with(options).await.expect("connect");
    let repo = SqliteRepository::new(pool);
    repo.migrate().await.expect("migrate");
    // Leak the tempfile handle for the test's lifetime; it's cleaned up
    // when the process exits, which is fine for a short-lived test binary.
    std::mem::forget(file);
    Arc::new(repo)
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.cloud.device_id = "kiosk-test".to_string();
    config.timers.prereservation_window_secs = 0;
    config.timers.checkout_window_secs = 0;
    config.timers.reservation_window_secs = 0;
    config
}

async fn seed_slot(repo: &Arc<dyn Repository>, unit: i32, tray: i32, location: i32, variant: i64, quantity: i32) {
    repo.upsert_inventory_slot(&InventorySlot {
        unit_id: UnitId(unit),
        tray_number: TrayNumber(tray),
        location: Location(location),
        variant_id: VariantId(variant),
        width: 1,
        depth: 1,
        quantity,
    })
    .await
    .expect("seed slot");
}

async fn settle() {
    // Give the engine's mpsc worker a turn to drain a command posted
    // through the bus subscription path.
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// S1: a local-cart purchase, start to finish. Update reserves stock,
/// dispense hands off the reservations, PURCHASE_FINISHED tears the cart
/// down with no surviving rows (invariant 3).
#[tokio::test]
async fn s1_local_purchase_happy_path() {
    let repo = test_repo().await;
    seed_slot(&repo, 1, 1, 1, 42, 5).await;

    let bus = EventBus::new();
    let cloud: Arc<dyn CloudClient> = Arc::new(MockCloudClient { transaction_id: "T-1".to_string() });
    let config = test_config();
    let (engine, handle) = CartEngine::new(bus.clone(), cloud, repo.clone(), &config);
    engine.subscribe().await;

    let tx_id = TransactionId::unassigned(1);
    let (result, _) = handle.update(tx_id.clone(), 1, CartType::Local, VariantId(42), 2).await;
    assert_eq!(result, OperationResult::Ok);

    let cart = repo.get_cart_by_transaction(&tx_id).await.unwrap().expect("cart exists");
    let items = repo.list_cart_items(cart.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].amount, 2);
    let reservations = repo.list_reservations_for_cart(cart.id).await.unwrap();
    let reserved: i32 = reservations.iter().map(|r| r.quantity).sum();
    assert_eq!(reserved, 2);

    let (result, _) = handle.dispense(tx_id.clone(), 1).await;
    assert_eq!(result, OperationResult::Ok);

    bus.post(Event::purchase_finished(cart.id.0)).await;
    bus.tick().await;
    settle().await;

    assert!(repo.get_cart(cart.id).await.unwrap().is_none());
    assert!(repo.list_cart_items(cart.id).await.unwrap().is_empty());
    assert!(repo.list_reservations_for_cart(cart.id).await.unwrap().is_empty());
}

/// S2: requesting more than is on hand is rejected (NOK), and reserves
/// nothing — the inventory is left untouched.
#[tokio::test]
async fn s2_insufficient_stock_is_rejected() {
    let repo = test_repo().await;
    seed_slot(&repo, 1, 1, 1, 42, 1).await;

    let bus = EventBus::new();
    let cloud: Arc<dyn CloudClient> = Arc::new(MockCloudClient { transaction_id: "T-2".to_string() });
    let config = test_config();
    let (engine, handle) = CartEngine::new(bus, cloud, repo.clone(), &config);
    engine.subscribe().await;

    let tx_id = TransactionId::unassigned(2);
    let (result, _) = handle.update(tx_id.clone(), 2, CartType::Local, VariantId(42), 2).await;
    assert_eq!(result, OperationResult::Nok);

    let cart = repo.get_cart_by_transaction(&tx_id).await.unwrap().expect("cart row still created");
    assert!(repo.list_cart_items(cart.id).await.unwrap().is_empty());
    assert!(repo.list_reservations_for_cart(cart.id).await.unwrap().is_empty());
}

/// S3: a remote cart's prereservation times out if nothing confirms it —
/// the sweep emits RESERVATION_COMPLETED(Expired) and clears the cart.
#[tokio::test]
async fn s3_prereservation_expiry() {
    let repo = test_repo().await;
    seed_slot(&repo, 1, 1, 1, 42, 5).await;

    let bus = EventBus::new();
    let cloud: Arc<dyn CloudClient> = Arc::new(MockCloudClient { transaction_id: "T-3".to_string() });
    let config = test_config();
    let (engine, handle) = CartEngine::new(bus.clone(), cloud, repo.clone(), &config);
    engine.subscribe().await;

    let tx_id = TransactionId("remote-tx-3".to_string());
    let (result, _) = handle.update(tx_id.clone(), 3, CartType::Remote, VariantId(42), 1).await;
    assert_eq!(result, OperationResult::Ok);
    let cart = repo.get_cart_by_transaction(&tx_id).await.unwrap().expect("cart exists");

    let seen = Arc::new(std::sync::Mutex::new(false));
    let seen2 = seen.clone();
    bus.subscribe(
        "RESERVATION_COMPLETED",
        Arc::new(move |_: &Event| {
            *seen2.lock().unwrap() = true;
        }),
    )
    .await;

    // prereservation_window_secs is 0, so the deadline is already in the
    // past by the time the sweep runs.
    tokio::time::sleep(Duration::from_millis(5)).await;
    engine.sweep_short().await;
    bus.tick().await;

    assert!(*seen.lock().unwrap(), "RESERVATION_COMPLETED was not posted");
    assert!(repo.get_cart(cart.id).await.unwrap().is_none());
}

/// S4: a planogram reshuffle that removes a reserved slot relocates the
/// reservation to another slot of the same variant in the same unit,
/// rather than losing it.
#[tokio::test]
async fn s4_planogram_reshuffle_relocates_reservation() {
    let repo = test_repo().await;
    seed_slot(&repo, 1, 1, 1, 42, 5).await;

    let bus = EventBus::new();
    let cloud: Arc<dyn CloudClient> = Arc::new(MockCloudClient { transaction_id: "T-4".to_string() });
    let config = test_config();
    let (engine, handle) = CartEngine::new(bus.clone(), cloud, repo.clone(), &config);
    engine.subscribe().await;

    let tx_id = TransactionId::unassigned(4);
    let (result, _) = handle.update(tx_id.clone(), 4, CartType::Local, VariantId(42), 1).await;
    assert_eq!(result, OperationResult::Ok);
    let cart = repo.get_cart_by_transaction(&tx_id).await.unwrap().expect("cart exists");

    let before = repo.list_reservations_for_cart(cart.id).await.unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].location, Location(1));

    // The planogram moves variant 42 from (unit 1, loc 1) to (unit 1, loc 2).
    repo.delete_inventory_slot(UnitId(1), 1, 1).await.unwrap();
    seed_slot(&repo, 1, 1, 2, 42, 5).await;

    bus.post(Event::new(EventKind::PlanogramUpdateDone)).await;
    bus.tick().await;
    settle().await;

    let after = repo.list_reservations_for_cart(cart.id).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].location, Location(2));
    assert_eq!(after[0].quantity, before[0].quantity);
}

/// S5: a planogram update that would orphan a remote cart's reservation
/// (the variant is no longer in the staged layout at all) is rejected
/// before it's ever applied.
#[tokio::test]
async fn s5_planogram_rejected_when_reserved_product_absent() {
    let repo = test_repo().await;
    seed_slot(&repo, 1, 1, 1, 42, 5).await;

    let bus = EventBus::new();
    let cloud: Arc<dyn CloudClient> = Arc::new(MockCloudClient { transaction_id: "T-5".to_string() });
    let config = test_config();

    let (_cart_engine, cart_handle) = CartEngine::new(bus.clone(), cloud.clone(), repo.clone(), &config);
    let tx_id = TransactionId("remote-tx-5".to_string());
    let (result, _) = cart_handle.update(tx_id.clone(), 5, CartType::Remote, VariantId(42), 1).await;
    assert_eq!(result, OperationResult::Ok);
    let cart = repo.get_cart_by_transaction(&tx_id).await.unwrap().expect("cart exists");
    // Move it into Prereservation explicitly isn't needed: `update` on a
    // new remote cart already starts it in Prereservation status.
    assert_eq!(cart.status, kiosk_core::model::CartStatus::Prereservation);

    let planogram = PlanogramSynchronizer::new(bus.clone(), cloud, repo.clone(), &config);
    planogram.load_current_layout_from_repository().await.unwrap();

    let rejected = Arc::new(std::sync::Mutex::new(None));
    let rejected2 = rejected.clone();
    bus.subscribe(
        "NEW_PLANOGRAM_AVAILABLE",
        Arc::new(move |event: &Event| {
            if let EventKind::NewPlanogramAvailable { status, reason } = event.kind() {
                *rejected2.lock().unwrap() = Some((*status, *reason));
            }
        }),
    )
    .await;

    // A staged planogram that drops variant 42 entirely (replaced by 99),
    // changing the layout so it isn't a no-op re-apply.
    let staged_payload = serde_json::json!({
        "planogram": {
            "stocks": [{
                "number": 1,
                "trays": [{
                    "number": 1,
                    "slots": [{"number": 1, "width": 1, "depth": 1, "variantId": 99}]
                }]
            }]
        },
        "products": [],
        "collections": [],
    });
    struct StagedCloud {
        inner: Arc<dyn CloudClient>,
        payload: Value,
    }
    #[async_trait]
    impl CloudClient for StagedCloud {
        async fn get(&self, api: &str, device_id: &str, customer_id: Option<&str>) -> Result<Value, CloudError> {
            if api == "planogram" {
                Ok(self.payload.clone())
            } else {
                self.inner.get(api, device_id, customer_id).await
            }
        }
        async fn post(&self, api: &str, device_id: &str, customer_id: Option<&str>, body: Value) -> Result<Value, CloudError> {
            self.inner.post(api, device_id, customer_id, body).await
        }
        async fn download_image(&self, media_id: &str, dest: &Path) -> Result<u64, CloudError> {
            self.inner.download_image(media_id, dest).await
        }
    }
    let cloud_with_planogram: Arc<dyn CloudClient> =
        Arc::new(StagedCloud { inner: Arc::new(MockCloudClient { transaction_id: "T-5b".to_string() }), payload: staged_payload });
    let planogram_with_staged_cloud = PlanogramSynchronizer::new(bus.clone(), cloud_with_planogram, repo.clone(), &config);
    planogram_with_staged_cloud.load_current_layout_from_repository().await.unwrap();
    planogram_with_staged_cloud.subscribe().await;
    planogram_with_staged_cloud.on_inbound(kiosk_core::planogram::PlanogramInboundEvent::PlanogramUpdated);
    settle().await;
    bus.tick().await;
    settle().await;

    let outcome = rejected.lock().unwrap().expect("NEW_PLANOGRAM_AVAILABLE was posted");
    assert_eq!(outcome.0, false, "planogram update should be rejected");
    assert_eq!(outcome.1, kiosk_core::bus::PlanogramRejectReason::ReservedProductAbsent);
}

/// S6: the machine FSM's startup path, wired through a real event bus —
/// STARTUP_COMPLETE fires exactly once, on the Startup -> Available edge.
#[tokio::test]
async fn s6_machine_fsm_startup_to_available() {
    let bus = EventBus::new();
    let machine = MachineFsm::new(bus.clone());

    let startup_complete_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count2 = startup_complete_count.clone();
    bus.subscribe(
        "STARTUP_COMPLETE",
        Arc::new(move |_: &Event| {
            count2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }),
    )
    .await;

    machine.subscribe().await;
    assert_eq!(machine.current_state(), MachineState::Startup);

    bus.post(Event::new(EventKind::HwDispenserIsReady)).await;
    bus.tick().await;
    settle().await;
    bus.post(Event::new(EventKind::PlanogramUpdateDone)).await;
    bus.tick().await;
    settle().await;

    assert_eq!(machine.current_state(), MachineState::Available);
    bus.tick().await;
    assert_eq!(startup_complete_count.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// Invariant (spec.md §8): reserved quantity for a variant never exceeds
/// its total inventory, across a sequence of increasing and decreasing
/// updates to the same cart.
#[tokio::test]
async fn invariant_reservations_never_exceed_inventory() {
    let repo = test_repo().await;
    seed_slot(&repo, 1, 1, 1, 7, 3).await;

    let bus = EventBus::new();
    let cloud: Arc<dyn CloudClient> = Arc::new(MockCloudClient { transaction_id: "T-inv".to_string() });
    let config = test_config();
    let (_engine, handle) = CartEngine::new(bus, cloud, repo.clone(), &config);

    let tx_id = TransactionId::unassigned(100);
    for amount in [1, 1, 1, 1, -1, 2, -3] {
        handle.update(tx_id.clone(), 100, CartType::Local, VariantId(7), amount).await;
        let reservations = repo.list_reservations().await.unwrap();
        let reserved: i32 = reservations.iter().filter(|r| r.variant_id == VariantId(7)).map(|r| r.quantity).sum();
        assert!(reserved <= 3, "reserved {reserved} exceeded inventory of 3");
        assert!(reserved >= 0);
    }
}

/// Invariant (spec.md §8): CartItem.amount always equals the sum of that
/// item's live reservation quantities.
#[tokio::test]
async fn invariant_cart_item_amount_matches_reservation_sum() {
    let repo = test_repo().await;
    seed_slot(&repo, 1, 1, 1, 9, 5).await;

    let bus = EventBus::new();
    let cloud: Arc<dyn CloudClient> = Arc::new(MockCloudClient { transaction_id: "T-inv2".to_string() });
    let config = test_config();
    let (_engine, handle) = CartEngine::new(bus, cloud, repo.clone(), &config);

    let tx_id = TransactionId::unassigned(200);
    handle.update(tx_id.clone(), 200, CartType::Local, VariantId(9), 3).await;
    handle.update(tx_id.clone(), 200, CartType::Local, VariantId(9), -1).await;

    let cart = repo.get_cart_by_transaction(&tx_id).await.unwrap().unwrap();
    let items = repo.list_cart_items(cart.id).await.unwrap();
    let reservations = repo.list_reservations_for_cart(cart.id).await.unwrap();
    let item = items.iter().find(|i| i.variant_id == VariantId(9)).unwrap();
    let reserved: i32 = reservations.iter().filter(|r| r.variant_id == VariantId(9)).map(|r| r.quantity).sum();
    assert_eq!(item.amount, reserved);
}

/// Boundary case (spec.md §8): a zero-amount update is always an error,
/// regardless of cart state.
#[tokio::test]
async fn boundary_zero_amount_update_is_an_error() {
    let repo = test_repo().await;
    let bus = EventBus::new();
    let cloud: Arc<dyn CloudClient> = Arc::new(MockCloudClient { transaction_id: "T-zero".to_string() });
    let config = test_config();
    let (_engine, handle) = CartEngine::new(bus, cloud, repo.clone(), &config);

    let tx_id = TransactionId::unassigned(300);
    let (result, message) = handle.update(tx_id, 300, CartType::Local, VariantId(1), 0).await;
    assert_eq!(result, OperationResult::Error);
    assert!(!message.is_empty());
}

/// A dispense requested while the machine FSM reports `BUSY` is queued and
/// returns `PENDING` (spec.md §4.4); it is retried and completes once
/// `MACHINE_STATE_CHANGED` reports the machine is free again.
#[tokio::test]
async fn dispense_while_machine_busy_is_queued_then_completed() {
    let repo = test_repo().await;
    seed_slot(&repo, 1, 1, 1, 77, 5).await;

    let bus = EventBus::new();
    let machine = MachineFsm::new(bus.clone());
    machine.subscribe().await;

    let cloud: Arc<dyn CloudClient> = Arc::new(MockCloudClient { transaction_id: "T-busy".to_string() });
    let config = test_config();
    let (engine, handle) = CartEngine::new(bus.clone(), cloud, repo.clone(), &config);
    engine.subscribe().await;

    let tx_id = TransactionId::unassigned(7);
    let (result, _) = handle.update(tx_id.clone(), 7, CartType::Local, VariantId(77), 2).await;
    assert_eq!(result, OperationResult::Ok);

    machine.set_dispenser_ready(true).await;
    bus.tick().await;
    settle().await;
    machine.set_planogram_present(true).await;
    bus.tick().await;
    settle().await;
    assert_eq!(machine.current_state(), MachineState::Available);

    machine.set_dispensing_in_progress(true).await;
    bus.tick().await;
    settle().await;
    assert_eq!(machine.current_state(), MachineState::Busy);

    let (result, _) = handle.dispense(tx_id.clone(), 7).await;
    assert_eq!(result, OperationResult::Pending);

    let cart = repo.get_cart_by_transaction(&tx_id).await.unwrap().expect("cart exists");
    assert_ne!(cart.status, CartStatus::Dispensing);

    machine.set_dispensing_in_progress(false).await;
    bus.tick().await;
    settle().await;
    assert_eq!(machine.current_state(), MachineState::Available);

    let cart = repo.get_cart_by_transaction(&tx_id).await.unwrap().expect("cart exists");
    assert_eq!(cart.status, CartStatus::Dispensing);
}
