//! Machine FSM (C6, spec.md §4.5).
//!
//! Grounded in `logic/machine.py`: five boolean latches aggregated into
//! one observable `MachineState` atop the generic [`crate::fsm::Fsm`]
//! primitive. `STARTUP_COMPLETE` fires once, on exit of `STARTUP`;
//! `MACHINE_STATE_CHANGED` fires on every other transition.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::bus::{Event, EventBus, EventKind};
use crate::fsm::Fsm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    Startup,
    Available,
    Unavailable,
    Busy,
    Maintenance,
    Error,
    /// Reserved for the software update flow; spec.md §4.5 leaves its
    /// transition predicate unspecified, so no edge currently targets it.
    Update,
}

/// The five boolean latches the FSM's predicates are evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachineInputs {
    pub planogram_present: bool,
    pub dispenser_ready: bool,
    pub door_open: bool,
    pub hw_error: bool,
    pub dispensing_in_progress: bool,
}

fn available(i: &MachineInputs) -> bool {
    i.planogram_present && i.dispenser_ready && !i.door_open && !i.hw_error && !i.dispensing_in_progress
}

fn unavailable(i: &MachineInputs) -> bool {
    !i.planogram_present && i.dispenser_ready && !i.door_open && !i.hw_error && !i.dispensing_in_progress
}

fn busy(i: &MachineInputs) -> bool {
    i.dispensing_in_progress
}

fn maintenance(i: &MachineInputs) -> bool {
    i.door_open
}

fn error(i: &MachineInputs) -> bool {
    i.hw_error && !i.door_open
}

/// Aggregates hardware/planogram/activity signals into one observable
/// kiosk state and emits transitions on the event bus.
pub struct MachineFsm {
    fsm: Mutex<Fsm<MachineState, MachineInputs>>,
    inputs: Mutex<MachineInputs>,
    bus: EventBus,
}

impl MachineFsm {
    pub fn new(bus: EventBus) -> Arc<Self> {
        let mut fsm = Fsm::new();
        fsm.add_state(MachineState::Startup, None, None, true);
        fsm.add_state(MachineState::Available, None, None, false);
        fsm.add_state(MachineState::Unavailable, None, None, false);
        fsm.add_state(MachineState::Busy, None, None, false);
        fsm.add_state(MachineState::Maintenance, None, None, false);
        fsm.add_state(MachineState::Error, None, None, false);
        fsm.add_state(MachineState::Update, None, None, false);

        fsm.add_transition(MachineState::Startup, MachineState::Available, available);
        fsm.add_transition(MachineState::Startup, MachineState::Unavailable, unavailable);
        fsm.add_transition(MachineState::Startup, MachineState::Maintenance, maintenance);
        fsm.add_transition(MachineState::Startup, MachineState::Error, error);

        fsm.add_transition(MachineState::Available, MachineState::Unavailable, unavailable);
        fsm.add_transition(MachineState::Available, MachineState::Busy, busy);
        fsm.add_transition(MachineState::Available, MachineState::Maintenance, maintenance);
        fsm.add_transition(MachineState::Available, MachineState::Error, error);

        fsm.add_transition(MachineState::Unavailable, MachineState::Available, available);
        fsm.add_transition(MachineState::Unavailable, MachineState::Maintenance, maintenance);
        fsm.add_transition(MachineState::Unavailable, MachineState::Error, error);

        fsm.add_transition(MachineState::Busy, MachineState::Available, available);
        fsm.add_transition(MachineState::Busy, MachineState::Error, error);

        fsm.add_transition(MachineState::Maintenance, MachineState::Available, available);
        fsm.add_transition(MachineState::Maintenance, MachineState::Unavailable, unavailable);
        fsm.add_transition(MachineState::Maintenance, MachineState::Error, error);

        fsm.add_transition(MachineState::Error, MachineState::Available, available);
        fsm.add_transition(MachineState::Error, MachineState::Maintenance, maintenance);

        Arc::new(Self {
            fsm: Mutex::new(fsm),
            inputs: Mutex::new(MachineInputs::default()),
            bus,
        })
    }

    pub fn current_state(&self) -> MachineState {
        *self.fsm.lock().unwrap().current().unwrap()
    }

    /// Re-evaluate transitions with the currently-latched inputs and emit
    /// the matching events (spec.md §4.5). Called after any latch update.
    async fn evaluate(&self) {
        let was_startup = self.current_state() == MachineState::Startup;
        let inputs = *self.inputs.lock().unwrap();
        let transitioned = self.fsm.lock().unwrap().step(&inputs);

        if let Some(new_state) = transitioned {
            debug!(?new_state, "machine state transitioned");
            if was_startup {
                self.bus.post_high(Event::new(EventKind::StartupComplete)).await;
            }
            self.bus
                .post(Event::new(EventKind::MachineStateChanged { state: new_state }))
                .await;
        }
    }

    pub async fn set_planogram_present(&self, present: bool) {
        self.inputs.lock().unwrap().planogram_present = present;
        self.evaluate().await;
    }

    pub async fn set_dispenser_ready(&self, ready: bool) {
        self.inputs.lock().unwrap().dispenser_ready = ready;
        self.evaluate().await;
    }

    pub async fn set_door_open(&self, open: bool) {
        self.inputs.lock().unwrap().door_open = open;
        self.evaluate().await;
    }

    pub async fn set_hw_error(&self, error: bool) {
        self.inputs.lock().unwrap().hw_error = error;
        self.evaluate().await;
    }

    pub async fn set_dispensing_in_progress(&self, in_progress: bool) {
        self.inputs.lock().unwrap().dispensing_in_progress = in_progress;
        self.evaluate().await;
    }

    /// Wire the bus subscriptions that drive the five latches
    /// (`HW_DISPENSER_IS_READY`, `DOOR_STATE_CHANGED`,
    /// `PLANOGRAM_UPDATE_DONE`) from external/C4 signals.
    pub async fn subscribe(self: &Arc<Self>) {
        let this = self.clone();
        self.bus
            .subscribe(
                "HW_DISPENSER_IS_READY",
                Arc::new(move |_: &Event| {
                    let this = this.clone();
                    tokio::spawn(async move { this.set_dispenser_ready(true).await });
                }),
            )
            .await;

        let this = self.clone();
        self.bus
            .subscribe(
                "DOOR_STATE_CHANGED",
                Arc::new(move |event: &Event| {
                    if let EventKind::DoorStateChanged { open } = event.kind() {
                        let this = this.clone();
                        let open = *open;
                        tokio::spawn(async move { this.set_door_open(open).await });
                    }
                }),
            )
            .await;

        let this = self.clone();
        self.bus
            .subscribe(
                "PLANOGRAM_UPDATE_DONE",
                Arc::new(move |_: &Event| {
                    let this = this.clone();
                    tokio::spawn(async move { this.set_planogram_present(true).await });
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scenario_s6_startup_to_available_to_maintenance() {
        let bus = EventBus::new();
        let machine = MachineFsm::new(bus.clone());

        assert_eq!(machine.current_state(), MachineState::Startup);

        machine.set_dispenser_ready(true).await;
        assert_eq!(machine.current_state(), MachineState::Startup);

        machine.set_planogram_present(true).await;
        assert_eq!(machine.current_state(), MachineState::Available);

        machine.set_door_open(true).await;
        assert_eq!(machine.current_state(), MachineState::Maintenance);
    }

    #[tokio::test]
    async fn busy_takes_priority_over_available_predicate_order() {
        let bus = EventBus::new();
        let machine = MachineFsm::new(bus);
        machine.set_planogram_present(true).await;
        machine.set_dispenser_ready(true).await;
        assert_eq!(machine.current_state(), MachineState::Available);

        machine.set_dispensing_in_progress(true).await;
        assert_eq!(machine.current_state(), MachineState::Busy);
    }

    #[tokio::test]
    async fn idempotent_evaluate_does_not_re_transition() {
        let bus = EventBus::new();
        let machine = MachineFsm::new(bus);
        machine.set_planogram_present(true).await;
        machine.set_dispenser_ready(true).await;
        assert_eq!(machine.current_state(), MachineState::Available);
        machine.evaluate().await;
        assert_eq!(machine.current_state(), MachineState::Available);
    }

    #[tokio::test]
    async fn error_latched_without_door_open() {
        let bus = EventBus::new();
        let machine = MachineFsm::new(bus);
        machine.set_hw_error(true).await;
        assert_eq!(machine.current_state(), MachineState::Error);
    }
}
