//! Planogram Synchronizer (C4, spec.md §4.3).
//!
//! Grounded in `logic/planogram.py`: a single-threaded worker draining a
//! strict-FIFO queue of inbound catalog/planogram notifications, translated
//! from the Python `Condition`-guarded `deque` to a `tokio::sync::mpsc`
//! channel drained by one spawned task, the way the teacher moves work off
//! the bus dispatcher into a component's own queue (spec.md §4.1).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, EventKind, PlanogramRejectReason};
use crate::cloud::CloudClient;
use crate::config::Config;
use crate::error::ProtocolError;
use crate::model::{
    Collection, CollectionId, InventorySlot, Location, ObjectInfo, ObjectProperty, Product,
    ProductId, TrayNumber, UnitId, Variant, VariantId, VariantOption,
};
use crate::repository::Repository;

/// One slot in an in-memory layout, keyed by (unit, tray, location).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutSlot {
    pub variant_id: VariantId,
    pub width: i32,
    pub depth: i32,
}

/// `(unit, tray, location) -> slot` snapshot of a planogram (spec.md §4.3
/// step 1).
pub type Layout = HashMap<(UnitId, TrayNumber, Location), LayoutSlot>;

#[derive(Debug)]
enum PlanogramCommand {
    ProductUpdated { product_id: ProductId },
    ProductDeleted { product_id: ProductId },
    CollectionUpdated { collection_id: CollectionId },
    BrandUpdated { last_update: i64 },
    PlanogramUpdated,
    ApplyPlanogram,
    RejectPlanogram,
    GetPlanogram,
}

/// Parse an inbound IoT-topic payload into a worker command (spec.md §6).
/// A boundary function: malformed payloads are reported, never panic.
pub fn parse_inbound(topic: &str, payload: &[u8]) -> Result<PlanogramInboundEvent, ProtocolError> {
    let err = |message: String| ProtocolError { topic: topic.to_string(), message };
    let text = std::str::from_utf8(payload).map_err(|e| err(e.to_string()))?;

    match topic {
        "product" => {
            let data: ProductTopicPayload = serde_json::from_str(text).map_err(|e| err(e.to_string()))?;
            match data.update_type.as_str() {
                "update" => Ok(PlanogramInboundEvent::ProductUpdated { product_id: ProductId(data.product_id) }),
                "delete" => Ok(PlanogramInboundEvent::ProductDeleted { product_id: ProductId(data.product_id) }),
                other => Err(err(format!("unknown product update_type '{other}'"))),
            }
        }
        "collection" => {
            let data: CollectionTopicPayload = serde_json::from_str(text).map_err(|e| err(e.to_string()))?;
            if data.update_type != "update" {
                return Err(err(format!("unknown collection update_type '{}'", data.update_type)));
            }
            Ok(PlanogramInboundEvent::CollectionUpdated { collection_id: CollectionId(data.collection_id) })
        }
        "brand" => {
            let data: BrandTopicPayload = serde_json::from_str(text).map_err(|e| err(e.to_string()))?;
            Ok(PlanogramInboundEvent::BrandUpdated { last_update: data.last_update })
        }
        "planogram" => Ok(PlanogramInboundEvent::PlanogramUpdated),
        other => Err(err(format!("unsupported topic '{other}'"))),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PlanogramInboundEvent {
    ProductUpdated { product_id: ProductId },
    ProductDeleted { product_id: ProductId },
    CollectionUpdated { collection_id: CollectionId },
    BrandUpdated { last_update: i64 },
    PlanogramUpdated,
}

#[derive(Deserialize)]
struct ProductTopicPayload {
    update_type: String,
    product_id: i64,
}

#[derive(Deserialize)]
struct CollectionTopicPayload {
    update_type: String,
    collection_id: i64,
}

#[derive(Deserialize)]
struct BrandTopicPayload {
    #[serde(rename = "lastUpdate")]
    last_update: i64,
}

struct StagedData {
    products: Vec<Product>,
    collections: Vec<Collection>,
    variants: Vec<Variant>,
    layout: HashMap<UnitId, Layout>,
    ui_model: Value,
}

struct BrandInfo {
    last_update: i64,
    logo_id: i64,
    logo_url: String,
}

/// Product/collection/brand/planogram catalog synchronizer (C4).
pub struct PlanogramSynchronizer {
    bus: EventBus,
    cloud: Arc<dyn CloudClient>,
    repo: Arc<dyn Repository>,
    device_id: String,
    media_dir: PathBuf,
    data_dir: PathBuf,
    media_url_prefix: String,
    current_layout: Mutex<HashMap<UnitId, Layout>>,
    staged: Mutex<Option<StagedData>>,
    brand_info: Mutex<BrandInfo>,
    tx: mpsc::UnboundedSender<PlanogramCommand>,
}

impl PlanogramSynchronizer {
    pub fn new(bus: EventBus, cloud: Arc<dyn CloudClient>, repo: Arc<dyn Repository>, config: &Config) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            bus,
            cloud,
            repo,
            device_id: config.cloud.device_id.clone(),
            media_dir: PathBuf::from(&config.media.local_dir),
            data_dir: PathBuf::from(&config.storage.path).parent().map(PathBuf::from).unwrap_or_default(),
            media_url_prefix: config.media.url_prefix.clone(),
            current_layout: Mutex::new(HashMap::new()),
            staged: Mutex::new(None),
            brand_info: Mutex::new(BrandInfo { last_update: 0, logo_id: 0, logo_url: String::new() }),
            tx,
        });
        this.clone().spawn_worker(rx);
        this
    }

    /// Rebuild `current_layout` from the repository at startup (the
    /// Python constructor's per-unit `get_inventory_items_by_unit` loop).
    pub async fn load_current_layout_from_repository(&self) -> Result<(), crate::error::DbError> {
        let slots = self.repo.list_inventory_slots().await?;
        let mut layout: HashMap<UnitId, Layout> = HashMap::new();
        for slot in slots {
            layout.entry(slot.unit_id).or_default().insert(
                (slot.unit_id, slot.tray_number, slot.location),
                LayoutSlot { variant_id: slot.variant_id, width: slot.width, depth: slot.depth },
            );
        }
        *self.current_layout.lock().await = layout;
        Ok(())
    }

    fn spawn_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PlanogramCommand>) {
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                self.handle_command(cmd).await;
            }
        });
    }

    async fn handle_command(&self, cmd: PlanogramCommand) {
        match cmd {
            PlanogramCommand::ProductUpdated { product_id } => self.on_product_updated(product_id).await,
            PlanogramCommand::ProductDeleted { product_id } => self.on_product_deleted(product_id).await,
            PlanogramCommand::CollectionUpdated { collection_id } => self.on_collection_updated(collection_id).await,
            PlanogramCommand::BrandUpdated { last_update } => self.on_brand_updated(last_update).await,
            PlanogramCommand::PlanogramUpdated | PlanogramCommand::GetPlanogram => self.on_planogram_updated().await,
            PlanogramCommand::ApplyPlanogram => self.commit().await,
            PlanogramCommand::RejectPlanogram => {
                *self.staged.lock().await = None;
            }
        }
    }

    /// Wire bus subscriptions for `NEW_PLANOGRAM_APPLY`/`NEW_PLANOGRAM_REJECT`/`GET_PLANOGRAM`
    /// and dispatch IoT-topic notifications into the worker queue.
    pub async fn subscribe(self: &Arc<Self>) {
        let tx = self.tx.clone();
        self.bus
            .subscribe(
                "NEW_PLANOGRAM_APPLY",
                Arc::new(move |_: &Event| {
                    let _ = tx.send(PlanogramCommand::ApplyPlanogram);
                }),
            )
            .await;

        let tx = self.tx.clone();
        self.bus
            .subscribe(
                "NEW_PLANOGRAM_REJECT",
                Arc::new(move |_: &Event| {
                    let _ = tx.send(PlanogramCommand::RejectPlanogram);
                }),
            )
            .await;

        let tx = self.tx.clone();
        self.bus
            .subscribe(
                "GET_PLANOGRAM",
                Arc::new(move |_: &Event| {
                    let _ = tx.send(PlanogramCommand::GetPlanogram);
                }),
            )
            .await;
    }

    /// Route an already-parsed inbound IoT notification onto the worker.
    pub fn on_inbound(&self, event: PlanogramInboundEvent) {
        let cmd = match event {
            PlanogramInboundEvent::ProductUpdated { product_id } => PlanogramCommand::ProductUpdated { product_id },
            PlanogramInboundEvent::ProductDeleted { product_id } => PlanogramCommand::ProductDeleted { product_id },
            PlanogramInboundEvent::CollectionUpdated { collection_id } => {
                PlanogramCommand::CollectionUpdated { collection_id }
            }
            PlanogramInboundEvent::BrandUpdated { last_update } => PlanogramCommand::BrandUpdated { last_update },
            PlanogramInboundEvent::PlanogramUpdated => PlanogramCommand::PlanogramUpdated,
        };
        let _ = self.tx.send(cmd);
    }

    async fn on_product_updated(&self, product_id: ProductId) {
        let Ok(Some(product)) = self.repo.get_product(product_id).await else { return };
        let data = match self.cloud.get("product", &self.device_id, None).await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "product update GET failed");
                return;
            }
        };
        if let Err(e) = self.apply_product_update(product, data).await {
            error!(error = %e, "product update payload malformed");
        }
    }

    async fn apply_product_update(&self, mut product: Product, data: Value) -> Result<(), String> {
        let last_update = data.get("last_update").and_then(Value::as_i64).ok_or("missing last_update")?;
        if last_update != product.last_update {
            product.last_update = last_update;
            product.product_type = data.get("product_type").and_then(Value::as_str).unwrap_or_default().to_string();
            product.tags = data
                .get("tags")
                .and_then(Value::as_array)
                .map(|tags| tags.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(","))
                .unwrap_or_default();
            product.info = parse_localization(&data);
        }
        self.repo.upsert_product(&product).await.map_err(|e| e.to_string())?;
        info!(product_id = product.id.0, "product updated");
        Ok(())
    }

    async fn on_product_deleted(&self, product_id: ProductId) {
        let Ok(Some(product)) = self.repo.get_product(product_id).await else { return };
        for variant_id in product.variant_ids {
            if let Ok(Some(mut variant)) = self.repo.get_variant(variant_id).await {
                variant.deleted = true;
                let _ = self.repo.upsert_variant(&variant).await;
            }
        }
    }

    async fn on_collection_updated(&self, collection_id: CollectionId) {
        let Ok(Some(mut collection)) = self.repo.get_collection(collection_id).await else { return };
        let data = match self.cloud.get("collection", &self.device_id, None).await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "collection update GET failed");
                return;
            }
        };
        let last_update = match data.get("last_update").and_then(Value::as_i64) {
            Some(v) => v,
            None => return,
        };
        if last_update != collection.last_update {
            collection.last_update = last_update;
            collection.info = parse_localization(&data);
            collection.product_ids = data
                .get("products")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_i64).map(ProductId).collect())
                .unwrap_or_default();
        }
        let _ = self.repo.upsert_collection(&collection).await;
        info!(collection_id = collection.id.0, "collection updated");
    }

    /// Brand update: monotonic `lastUpdate` guard, logo re-download only
    /// when `logoId` changed, degrades to "no download" when `logoUrl` is
    /// absent (`kiosk_backend.py`'s additional robustness, spec.md §4.3).
    async fn on_brand_updated(&self, requested_last_update: i64) {
        let current = {
            let info = self.brand_info.lock().await;
            (info.last_update, info.logo_id, info.logo_url.clone())
        };
        if requested_last_update != 0 && requested_last_update <= current.0 {
            debug!("brand update requested but already current");
            return;
        }

        let data = match self.cloud.get("brand", &self.device_id, None).await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "brand update GET failed");
                return;
            }
        };
        let new_last_update = match data.get("lastUpdate").and_then(Value::as_i64) {
            Some(v) => v,
            None => return,
        };
        if new_last_update <= current.0 {
            info!("retrieved brand-info but already current");
            return;
        }
        let new_logo_id = data.get("logoId").and_then(Value::as_i64).unwrap_or(current.1);
        // Graceful degradation: without a `logoUrl` the endpoint has nothing
        // to serve yet, so skip the download and keep the previous logo.
        let logo_url = if new_logo_id != current.1 && data.get("logoUrl").and_then(Value::as_str).is_some() {
            let dest = self.media_dir.join(format!("brand-logo-{new_logo_id}"));
            match self.cloud.download_image(&new_logo_id.to_string(), &dest).await {
                Ok(_) => format!("{}/brand-logo-{new_logo_id}", self.media_url_prefix),
                Err(e) => {
                    error!(error = %e, "brand logo download failed");
                    current.2
                }
            }
        } else {
            current.2
        };

        *self.brand_info.lock().await = BrandInfo { last_update: new_last_update, logo_id: new_logo_id, logo_url: logo_url.clone() };

        let brand_json = serde_json::json!({ "lastUpdate": new_last_update, "logoId": new_logo_id, "logoUrl": logo_url });
        if let Err(e) = tokio::fs::write(self.data_dir.join("brand-info.json"), brand_json.to_string()).await {
            warn!(error = %e, "failed to persist brand-info.json");
        }
        self.bus.post_low(Event::new(EventKind::BrandInfoUpdated)).await;
    }

    /// Planogram update (spec.md §4.3 steps 1-4): fetch, diff against the
    /// current layout, and either apply immediately (unchanged) or stage
    /// and ask for operator confirmation.
    async fn on_planogram_updated(&self) {
        let data = match self.cloud.get("planogram", &self.device_id, None).await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "planogram GET failed");
                self.bus.post(Event::new(EventKind::PlanogramUpdateFailed)).await;
                return;
            }
        };

        let new_layout = match parse_stocks(&data) {
            Ok(layout) => layout,
            Err(message) => {
                error!(message, "planogram payload malformed");
                self.bus.post(Event::new(EventKind::PlanogramUpdateFailed)).await;
                return;
            }
        };

        let current_layout = self.current_layout.lock().await.clone();
        let unchanged = layouts_equal(&current_layout, &new_layout);

        let (products, collections, variants) = match parse_catalog(&data) {
            Ok(v) => v,
            Err(message) => {
                error!(message, "planogram catalog payload malformed");
                self.bus.post(Event::new(EventKind::PlanogramUpdateFailed)).await;
                return;
            }
        };
        let ui_model = data.get("uiModel").cloned().unwrap_or(Value::Null);

        *self.staged.lock().await = Some(StagedData { products, collections, variants, layout: new_layout, ui_model });

        if unchanged {
            self.apply_new_data().await;
            self.bus.post(Event::new(EventKind::PlanogramIsUpToDate)).await;
        } else {
            let (ok, reason) = self.validate_against_reservations().await;
            self.bus
                .post(Event::new(EventKind::NewPlanogramAvailable { status: ok, reason }))
                .await;
        }
    }

    /// Check reserved variants against the staged layout (spec.md §4.3
    /// step 3). Reservation ownership lives in C5; this walks the
    /// repository directly the way `logic/planogram.py`'s
    /// `_validate_new_planogram_against_reservations` does.
    async fn validate_against_reservations(&self) -> (bool, PlanogramRejectReason) {
        let staged = self.staged.lock().await;
        let Some(staged) = staged.as_ref() else {
            return (true, PlanogramRejectReason::None);
        };
        let new_variant_ids: std::collections::HashSet<VariantId> = staged.variants.iter().map(|v| v.id).collect();

        let carts = match self.repo.list_carts().await {
            Ok(c) => c,
            Err(_) => return (true, PlanogramRejectReason::None),
        };
        let mut reserved_variants = Vec::new();
        for cart in carts {
            let is_remote_pending = matches!(cart.cart_type, crate::model::CartType::Remote)
                && matches!(cart.status, crate::model::CartStatus::Prereservation | crate::model::CartStatus::Reserved);
            if !is_remote_pending {
                continue;
            }
            if let Ok(items) = self.repo.list_cart_items(cart.id).await {
                for item in items {
                    reserved_variants.push(item.variant_id);
                    if !new_variant_ids.contains(&item.variant_id) {
                        return (false, PlanogramRejectReason::ReservedProductAbsent);
                    }
                }
            }
        }

        let current_layout = self.current_layout.lock().await;
        for variant_id in reserved_variants {
            for unit_id in current_layout.keys().chain(staged.layout.keys()).collect::<std::collections::HashSet<_>>() {
                let current_count = current_layout
                    .get(unit_id)
                    .map(|layout| layout.values().filter(|s| s.variant_id == variant_id).count())
                    .unwrap_or(0);
                let new_count = staged
                    .layout
                    .get(unit_id)
                    .map(|layout| layout.values().filter(|s| s.variant_id == variant_id).count())
                    .unwrap_or(0);
                if current_count > new_count {
                    return (false, PlanogramRejectReason::ReservedProductOccupiesLessSlots);
                }
            }
        }
        (true, PlanogramRejectReason::None)
    }

    /// Commit: apply staged catalog + layout, emit `PLANOGRAM_UPDATE_DONE`
    /// (triggered by external `NEW_PLANOGRAM_APPLY`, spec.md §4.3).
    async fn commit(&self) {
        self.apply_new_data().await;
        if let Err(e) = self.apply_new_planogram().await {
            error!(error = %e, "planogram commit failed");
            self.bus.post(Event::new(EventKind::PlanogramUpdateFailed)).await;
            return;
        }
        self.bus.post(Event::new(EventKind::PlanogramUpdateDone)).await;
    }

    /// "Applies new data": upsert staged products/collections/variants,
    /// delete entities absent from the staged set, write the UI model if
    /// changed (spec.md §4.3 commit, step 1).
    async fn apply_new_data(&self) {
        let staged = self.staged.lock().await;
        let Some(staged) = staged.as_ref() else { return };

        for product in &staged.products {
            let _ = self.repo.upsert_product(product).await;
        }
        for collection in &staged.collections {
            let _ = self.repo.upsert_collection(collection).await;
        }
        for variant in &staged.variants {
            let _ = self.repo.upsert_variant(variant).await;
        }

        if let Ok(existing_products) = self.repo.list_products().await {
            let staged_ids: std::collections::HashSet<_> = staged.products.iter().map(|p| p.id).collect();
            for product in existing_products {
                if !staged_ids.contains(&product.id) {
                    let _ = self.repo.delete_product(product.id).await;
                }
            }
        }
        if let Ok(existing_collections) = self.repo.list_collections().await {
            let staged_ids: std::collections::HashSet<_> = staged.collections.iter().map(|c| c.id).collect();
            for collection in existing_collections {
                if !staged_ids.contains(&collection.id) {
                    let _ = self.repo.delete_collection(collection.id).await;
                }
            }
        }

        if staged.ui_model != Value::Null {
            if let Err(e) = tokio::fs::write(self.data_dir.join("ui-model.json"), staged.ui_model.to_string()).await {
                warn!(error = %e, "failed to persist ui-model.json");
            } else {
                self.bus.post(Event::new(EventKind::UiModelUpdated)).await;
            }
        }
    }

    /// "Applies new planogram": diff the staged layout against the
    /// current one, insert/update/delete inventory slots, swap current <-
    /// staged (spec.md §4.3 commit, step 2; open question §9.1 resolved
    /// by [`diff_planogram`]).
    async fn apply_new_planogram(&self) -> Result<(), crate::error::DbError> {
        let mut staged = self.staged.lock().await;
        let Some(staged_data) = staged.take() else { return Ok(()) };

        let current = self.current_layout.lock().await.clone();
        let mut current_flat: Layout = HashMap::new();
        for layout in current.values() {
            current_flat.extend(layout.iter().map(|(k, v)| (*k, *v)));
        }
        let mut new_flat: Layout = HashMap::new();
        for layout in staged_data.layout.values() {
            new_flat.extend(layout.iter().map(|(k, v)| (*k, *v)));
        }

        let mut current_quantities = HashMap::new();
        for slot in self.repo.list_inventory_slots().await? {
            current_quantities.insert((slot.unit_id, slot.tray_number, slot.location), slot.quantity);
        }

        let diff = diff_planogram(&current_flat, &new_flat, &current_quantities);
        for key in &diff.inserted {
            let slot = new_flat[key];
            self.repo
                .upsert_inventory_slot(&InventorySlot {
                    unit_id: key.0,
                    tray_number: key.1,
                    location: key.2,
                    variant_id: slot.variant_id,
                    width: slot.width,
                    depth: slot.depth,
                    quantity: 0,
                })
                .await?;
        }
        for (key, quantity) in &diff.updated {
            let slot = new_flat[key];
            self.repo
                .upsert_inventory_slot(&InventorySlot {
                    unit_id: key.0,
                    tray_number: key.1,
                    location: key.2,
                    variant_id: slot.variant_id,
                    width: slot.width,
                    depth: slot.depth,
                    quantity: *quantity,
                })
                .await?;
        }
        for key in &diff.deleted {
            self.repo.delete_inventory_slot(key.0, key.1 .0, key.2 .0).await?;
        }

        *self.current_layout.lock().await = staged_data.layout;
        Ok(())
    }
}

/// A slot-level diff between two layouts (spec.md §4.3 commit, step 2).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LayoutDiff {
    pub inserted: Vec<(UnitId, TrayNumber, Location)>,
    /// Updated keys paired with the quantity to preserve (or 0 when the
    /// variant at that key changed).
    pub updated: Vec<((UnitId, TrayNumber, Location), i32)>,
    pub deleted: Vec<(UnitId, TrayNumber, Location)>,
}

/// Diff two flattened layouts. Resolves spec.md §9.1: a slot whose key is
/// unchanged keeps its existing quantity when `variant_id` is unchanged
/// too (a restock/repack of the same product), and resets to 0 when the
/// variant at that key changed (a new product took the slot).
///
/// `current_quantities` is the persisted quantity at each key (`Layout`
/// itself carries no quantity, only catalog-shape fields), used to look up
/// the value to preserve.
pub fn diff_planogram(
    current: &Layout,
    new: &Layout,
    current_quantities: &HashMap<(UnitId, TrayNumber, Location), i32>,
) -> LayoutDiff {
    let mut diff = LayoutDiff::default();
    for (key, new_slot) in new {
        match current.get(key) {
            None => diff.inserted.push(*key),
            Some(current_slot) => {
                if current_slot != new_slot {
                    let preserved = if current_slot.variant_id == new_slot.variant_id {
                        current_quantities.get(key).copied().unwrap_or(0)
                    } else {
                        0
                    };
                    diff.updated.push((*key, preserved));
                }
            }
        }
    }
    for key in current.keys() {
        if !new.contains_key(key) {
            diff.deleted.push(*key);
        }
    }
    diff
}

fn layouts_equal(a: &HashMap<UnitId, Layout>, b: &HashMap<UnitId, Layout>) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(unit, layout)| b.get(unit).map(|other| other == layout).unwrap_or(false))
}

fn parse_stocks(data: &Value) -> Result<HashMap<UnitId, Layout>, String> {
    let stocks = data
        .pointer("/planogram/stocks")
        .and_then(Value::as_array)
        .ok_or("missing planogram.stocks")?;

    let mut layout = HashMap::new();
    for stock in stocks {
        let unit_id = UnitId(stock.get("number").and_then(Value::as_i64).ok_or("missing stock.number")? as i32);
        let mut trays: Layout = HashMap::new();
        for tray in stock.get("trays").and_then(Value::as_array).ok_or("missing stock.trays")? {
            let tray_number = TrayNumber(tray.get("number").and_then(Value::as_i64).ok_or("missing tray.number")? as i32);
            for slot in tray.get("slots").and_then(Value::as_array).ok_or("missing tray.slots")? {
                let location = Location(slot.get("number").and_then(Value::as_i64).ok_or("missing slot.number")? as i32);
                let width = slot.get("width").and_then(Value::as_i64).ok_or("missing slot.width")? as i32;
                let depth = slot.get("depth").and_then(Value::as_i64).ok_or("missing slot.depth")? as i32;
                let variant_id = VariantId(slot.get("variantId").and_then(Value::as_i64).ok_or("missing slot.variantId")?);
                trays.insert((unit_id, tray_number, location), LayoutSlot { variant_id, width, depth });
            }
        }
        layout.insert(unit_id, trays);
    }
    Ok(layout)
}

fn parse_catalog(data: &Value) -> Result<(Vec<Product>, Vec<Collection>, Vec<Variant>), String> {
    let mut products = Vec::new();
    let mut variants = Vec::new();
    for prod in data.get("products").and_then(Value::as_array).ok_or("missing products")? {
        let product_id = ProductId(prod.get("id").and_then(Value::as_i64).ok_or("missing product.id")?);
        let mut variant_ids = Vec::new();
        for var in prod.get("variants").and_then(Value::as_array).ok_or("missing product.variants")? {
            let variant_id = VariantId(var.get("id").and_then(Value::as_i64).ok_or("missing variant.id")?);
            variant_ids.push(variant_id);
            variants.push(parse_variant(var, product_id, variant_id)?);
        }
        products.push(Product {
            id: product_id,
            last_update: prod.get("last_update").and_then(Value::as_i64).unwrap_or_default(),
            product_type: prod.get("product_type").and_then(Value::as_str).unwrap_or_default().to_string(),
            tags: prod
                .get("tags")
                .and_then(Value::as_array)
                .map(|tags| tags.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(","))
                .unwrap_or_default(),
            info: parse_localization(prod),
            properties: parse_properties(prod),
            variant_ids,
        });
    }

    let mut collections = Vec::new();
    for coll in data.get("collections").and_then(Value::as_array).ok_or("missing collections")? {
        collections.push(Collection {
            id: CollectionId(coll.get("id").and_then(Value::as_i64).ok_or("missing collection.id")?),
            last_update: coll.get("last_update").and_then(Value::as_i64).unwrap_or_default(),
            media: coll.get("image").map(|img| crate::model::Media {
                filename: img.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
                last_update: img.get("last_update").and_then(Value::as_i64).unwrap_or_default(),
            }),
            info: parse_localization(coll),
            product_ids: coll
                .get("products")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_i64).map(ProductId).collect())
                .unwrap_or_default(),
        });
    }

    Ok((products, collections, variants))
}

fn parse_variant(var: &Value, product_id: ProductId, variant_id: VariantId) -> Result<Variant, String> {
    Ok(Variant {
        id: variant_id,
        product_id,
        price: var.get("price").and_then(Value::as_i64).unwrap_or_default(),
        compare_price: var.get("price_cmp").and_then(Value::as_i64).unwrap_or_default(),
        price_formatted: var.get("price_fmt").and_then(Value::as_str).unwrap_or_default().to_string(),
        compare_price_formatted: var.get("price_cmp_fmt").and_then(Value::as_str).unwrap_or_default().to_string(),
        deleted: var.get("deleted").and_then(Value::as_bool).unwrap_or(false),
        media: var.get("image").map(|img| crate::model::Media {
            filename: img.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
            last_update: img.get("last_update").and_then(Value::as_i64).unwrap_or_default(),
        }),
        info: parse_localization(var),
        properties: parse_properties(var),
        options: var
            .get("options")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .map(|o| VariantOption {
                        option: o.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
                        value: o.get("value").and_then(Value::as_str).unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn parse_localization(data: &Value) -> HashMap<String, ObjectInfo> {
    data.get("localization")
        .and_then(Value::as_array)
        .map(|locs| {
            locs.iter()
                .filter_map(|loc| {
                    let language = loc.get("language").and_then(Value::as_str)?;
                    Some((
                        language.to_string(),
                        ObjectInfo {
                            name: loc.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                            description: loc.get("description").and_then(Value::as_str).unwrap_or_default().to_string(),
                        },
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_properties(data: &Value) -> HashMap<String, Vec<ObjectProperty>> {
    data.get("localization")
        .and_then(Value::as_array)
        .map(|locs| {
            locs.iter()
                .filter_map(|loc| {
                    let language = loc.get("language").and_then(Value::as_str)?;
                    let props = loc
                        .get("properties")
                        .and_then(Value::as_array)
                        .map(|props| {
                            props
                                .iter()
                                .map(|p| ObjectProperty {
                                    prop_type: p.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
                                    name: p.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                                    value: p.get("value").and_then(Value::as_str).unwrap_or_default().to_string(),
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    Some((language.to_string(), props))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inbound_product_update() {
        let payload = br#"{"update_type":"update","product_id":7}"#;
        let event = parse_inbound("product", payload).unwrap();
        assert_eq!(event, PlanogramInboundEvent::ProductUpdated { product_id: ProductId(7) });
    }

    #[test]
    fn parse_inbound_product_delete() {
        let payload = br#"{"update_type":"delete","product_id":7}"#;
        let event = parse_inbound("product", payload).unwrap();
        assert_eq!(event, PlanogramInboundEvent::ProductDeleted { product_id: ProductId(7) });
    }

    #[test]
    fn parse_inbound_rejects_unknown_topic() {
        assert!(parse_inbound("unknown", b"{}").is_err());
    }

    #[test]
    fn parse_inbound_rejects_malformed_json() {
        assert!(parse_inbound("product", b"not json").is_err());
    }

    fn slot(variant_id: i64, width: i32, depth: i32) -> LayoutSlot {
        LayoutSlot { variant_id: VariantId(variant_id), width, depth }
    }

    #[test]
    fn diff_planogram_detects_insert_update_delete() {
        let key_a = (UnitId(1), TrayNumber(1), Location(1));
        let key_b = (UnitId(1), TrayNumber(1), Location(2));
        let key_c = (UnitId(1), TrayNumber(1), Location(3));

        let mut current = Layout::new();
        current.insert(key_a, slot(1, 1, 1));
        current.insert(key_b, slot(2, 1, 1));

        let mut new = Layout::new();
        new.insert(key_a, slot(1, 1, 1)); // unchanged
        new.insert(key_b, slot(3, 1, 1)); // variant changed
        new.insert(key_c, slot(4, 1, 1)); // inserted

        let mut quantities = HashMap::new();
        quantities.insert(key_b, 6);

        let diff = diff_planogram(&current, &new, &quantities);
        assert_eq!(diff.inserted, vec![key_c]);
        assert_eq!(diff.updated, vec![(key_b, 0)]); // variant changed, quantity resets
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn diff_planogram_preserves_quantity_when_variant_unchanged() {
        let key_a = (UnitId(1), TrayNumber(1), Location(1));

        let mut current = Layout::new();
        current.insert(key_a, slot(1, 10, 10));

        let mut new = Layout::new();
        new.insert(key_a, slot(1, 12, 10)); // same variant, repacked with new width

        let mut quantities = HashMap::new();
        quantities.insert(key_a, 7);

        let diff = diff_planogram(&current, &new, &quantities);
        assert_eq!(diff.updated, vec![(key_a, 7)]);
    }

    #[test]
    fn diff_planogram_detects_removed_slot() {
        let key_a = (UnitId(1), TrayNumber(1), Location(1));
        let mut current = Layout::new();
        current.insert(key_a, slot(1, 1, 1));
        let new = Layout::new();

        let diff = diff_planogram(&current, &new, &HashMap::new());
        assert_eq!(diff.deleted, vec![key_a]);
    }

    #[test]
    fn layouts_equal_detects_identical_maps() {
        let mut layout_a: Layout = HashMap::new();
        layout_a.insert((UnitId(1), TrayNumber(1), Location(1)), slot(1, 1, 1));
        let mut unit_a: HashMap<UnitId, Layout> = HashMap::new();
        unit_a.insert(UnitId(1), layout_a.clone());
        let mut unit_b: HashMap<UnitId, Layout> = HashMap::new();
        unit_b.insert(UnitId(1), layout_a);
        assert!(layouts_equal(&unit_a, &unit_b));
    }
}
