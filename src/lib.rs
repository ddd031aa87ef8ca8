//! `armcl`: a surface-constrained particle filter that localises an
//! external contact on an articulated manipulator from joint-torque
//! measurements. See the module-level docs of [`filter`] for the driver
//! that ties the pieces below together.

pub mod config;
pub mod density;
pub mod error;
pub mod filter;
pub mod mesh;
pub mod observation;
pub mod resampling;
pub mod samples;
pub mod state;
pub mod workers;
