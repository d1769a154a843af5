//! Visual effects driven by landmark detections.

pub mod firefly;
