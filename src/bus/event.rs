//! Event types and bodies (spec.md §6, exhaustive table).
//!
//! Each event is a named variant with a typed payload rather than an
//! opaque structured body, per the REDESIGN FLAG in spec.md §9 ("dynamic
//! dispatch via untyped event bodies... give each event a named variant
//! with a typed payload").

use serde_json::Value;

use crate::model::{CartId, CompletionStatus, Location, TransactionId, UnitId, VariantId};
use crate::machine::MachineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispensingPhase {
    StartedOneItem,
    FinishedOneItem,
    ErrorOneItem,
    WaitingForPickup,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanogramRejectReason {
    None,
    ReservedProductAbsent,
    ReservedProductOccupiesLessSlots,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    StartupComplete,
    SendToCloud {
        api: String,
        data: Value,
    },
    BrandInfoUpdated,
    UiModelUpdated,
    NewPlanogramAvailable {
        status: bool,
        reason: PlanogramRejectReason,
    },
    NewPlanogramApply,
    NewPlanogramReject,
    PlanogramUpdateDone,
    GetPlanogram,
    PlanogramIsUpToDate,
    PlanogramUpdateFailed,
    ReservationCompleted {
        transaction_id: TransactionId,
        status: CompletionStatus,
    },
    PurchaseFinished {
        cart_id: CartId,
    },
    BeginTransactionRequest {
        cart_id: CartId,
    },
    BeginTransactionResponse {
        cart_id: CartId,
        success: bool,
    },
    MachineStateChanged {
        state: MachineState,
    },
    DispensingStatus {
        cart_id: CartId,
        unit_id: UnitId,
        location: Location,
        variant_id: VariantId,
        status: DispensingPhase,
    },
    HumanDetected {
        display_id: i32,
        profile_id: String,
    },
    HwDispenserIsReady,
    DoorStateChanged {
        open: bool,
    },
}

impl EventKind {
    /// The stable tag used for subscription lookup, matching spec.md §6's
    /// event names verbatim.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StartupComplete => "STARTUP_COMPLETE",
            EventKind::SendToCloud { .. } => "SEND_TO_CLOUD",
            EventKind::BrandInfoUpdated => "BRAND_INFO_UPDATED",
            EventKind::UiModelUpdated => "UI_MODEL_UPDATED",
            EventKind::NewPlanogramAvailable { .. } => "NEW_PLANOGRAM_AVAILABLE",
            EventKind::NewPlanogramApply => "NEW_PLANOGRAM_APPLY",
            EventKind::NewPlanogramReject => "NEW_PLANOGRAM_REJECT",
            EventKind::PlanogramUpdateDone => "PLANOGRAM_UPDATE_DONE",
            EventKind::GetPlanogram => "GET_PLANOGRAM",
            EventKind::PlanogramIsUpToDate => "PLANOGRAM_IS_UP_TO_DATE",
            EventKind::PlanogramUpdateFailed => "PLANOGRAM_UPDATE_FAILED",
            EventKind::ReservationCompleted { .. } => "RESERVATION_COMPLETED",
            EventKind::PurchaseFinished { .. } => "PURCHASE_FINISHED",
            EventKind::BeginTransactionRequest { .. } => "BEGIN_TRANSACTION_REQUEST",
            EventKind::BeginTransactionResponse { .. } => "BEGIN_TRANSACTION_RESPONSE",
            EventKind::MachineStateChanged { .. } => "MACHINE_STATE_CHANGED",
            EventKind::DispensingStatus { .. } => "DISPENSING_STATUS",
            EventKind::HumanDetected { .. } => "HUMAN_DETECTED",
            EventKind::HwDispenserIsReady => "HW_DISPENSER_IS_READY",
            EventKind::DoorStateChanged { .. } => "DOOR_STATE_CHANGED",
        }
    }
}

/// An envelope posted to the event bus.
#[derive(Debug, Clone)]
pub struct Event(EventKind);

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &EventKind {
        &self.0
    }

    pub fn into_kind(self) -> EventKind {
        self.0
    }

    pub fn purchase_finished(cart_id: i64) -> Self {
        Self(EventKind::PurchaseFinished {
            cart_id: CartId(cart_id),
        })
    }
}
