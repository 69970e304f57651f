//! Room Coordination
//!
//! The controller actor that owns a conference room, plus the same-device
//! discovery bus it falls back to when no broker is reachable.

pub mod controller;
pub mod local_bus;

pub use controller::RoomController;
pub use local_bus::LocalBusRegistry;
