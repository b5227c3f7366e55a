// Core grid logic: ladder geometry, accounting and the per-symbol controller

pub mod controller;
pub mod indicators;
pub mod inventory;
pub mod ladder;
pub mod position;
pub mod types;

// Re-export commonly used types
pub use controller::{ControllerAction, ControllerSnapshot, ControllerState, GridController};
pub use position::SymbolState;
pub use types::{Bar, FillEvent, GatewayEvent, GridLevel, Order, OrderHandle, PositionSide, Side, TickUpdate};
