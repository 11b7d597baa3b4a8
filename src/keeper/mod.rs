//! Keeper: per-node agent driving the local database through the FSM

pub mod client;
pub mod control;
pub mod controller;
pub mod state;
pub mod transitions;

pub use client::{HttpMonitorClient, MonitorApi};
pub use control::{Keeper, Tick};
pub use controller::{CommandController, LocalObservation, NodeController, SimulatedController};
pub use state::{KeeperState, StateFile};
pub use transitions::{Operations, TransitionContext};
