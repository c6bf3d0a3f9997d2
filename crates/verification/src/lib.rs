//! Verification utilities for fsr-wgpu
//!
//! This crate compares the WGSL kernel running on a wgpu device against the host reference kernel.

pub mod cases;
pub mod compare;
