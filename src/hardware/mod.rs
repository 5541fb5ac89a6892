//! Hardware Capabilities
//!
//! Capability traits for the attenuator rig plus simulated implementations.
//! Vendor drivers live outside this crate and only need to implement the traits.

pub mod capabilities;
pub mod mock;

pub use capabilities::{PowerSensor, RotationActuator};
pub use mock::{MockRotationMount, ResponseModel, SimulatedPowerMeter, SimulatedRigConfig};
