//! Test utilities
//!
//! A software NIC that plays the externally-owned hardware port, and frame
//! builders for the data path.

pub mod frames;
pub mod sim_nic;

pub use sim_nic::SimNic;
