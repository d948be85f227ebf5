//! Control-plane library for a self-service vending kiosk.
//!
//! Modules mirror the subsystem split in spec.md §3: the prioritized
//! event bus (C1), the SQLite repository (C2), the cloud REST client
//! (C3), the planogram synchronizer (C4), the cart & reservation engine
//! (C5) and the machine FSM (C6), on top of a generic FSM primitive and
//! the shared model/error/config types.

pub mod bus;
pub mod cart;
pub mod cloud;
pub mod config;
pub mod error;
pub mod fsm;
pub mod machine;
pub mod model;
pub mod planogram;
pub mod repository;
