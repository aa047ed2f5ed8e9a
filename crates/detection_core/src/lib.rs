//! Box geometry and the region-proposal pipeline for a two-stage detector.
//!
//! This crate holds everything that does not need a tensor backend: bounding
//! boxes and IoU, anchor generation, box delta encoding/decoding, non-maximum
//! suppression, proposal decoding and the positive/negative/ignore target
//! assignment used to supervise both detector stages. All of it is
//! deterministic host-side `f32` computation; the network heads live in the
//! `frcnn` crate and consume these types at their boundaries.

pub mod anchors;
pub mod bbox;
pub mod coder;
pub mod error;
pub mod nms;
pub mod proposal;
pub mod targets;

pub use anchors::{AnchorConfig, AnchorGenerator};
pub use bbox::{BoundingBox, GtBox, ImageShape};
pub use coder::{decode, encode, BoxDelta};
pub use error::{ConfigError, ShapeError};
pub use nms::nms;
pub use proposal::{Proposal, ProposalConfig, ProposalDecoder};
pub use targets::{AssignedTarget, AssignerConfig, Label, TargetAssigner};
