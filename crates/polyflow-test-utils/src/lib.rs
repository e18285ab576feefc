//! Test and benchmark support for polyflow.
//!
//! The [`demo`] module contains a plaintext additive secret-sharing suite. It offers no security
//! whatsoever and only exists to drive the evaluation engine with realistic multi-round
//! operations, e.g. loops that depend on opened values.
#![deny(unsafe_code)]
#![deny(missing_docs)]

pub mod demo;
