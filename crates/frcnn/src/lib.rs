//! Burn-based network components of the two-stage detector.
//!
//! The geometry pipeline (anchors, NMS, proposal decoding, target
//! assignment) lives in `detection_core`; this crate adds the learned parts
//! and their losses:
//! - [`RpnHead`]: dense objectness and box regression over the feature map.
//! - [`RoiPool`]: fixed-size feature extraction per proposal.
//! - [`RcnnHead`]: per-proposal classification and per-class refinement.
//! - [`FasterRcnn`]: the orchestrator wiring backbone, proposal stage and
//!   classifier stage into one forward pass with a weighted joint loss.
//!
//! The backbone is an external collaborator behind the [`Backbone`] trait;
//! gradient application is owned by the external training loop.

pub mod backbone;
pub mod faster_rcnn;
pub mod loss;
pub mod rcnn;
pub mod roi_pool;
pub mod rpn;

pub use backbone::Backbone;
pub use faster_rcnn::{
    Detection, FasterRcnn, FasterRcnnConfig, LossWeights, PredictionBundle,
};
pub use rcnn::{rcnn_loss, RcnnHead, RcnnHeadConfig, RcnnLoss, RcnnOutput, RcnnTarget};
pub use roi_pool::{RoiPool, RoiPoolConfig};
pub use rpn::{rpn_loss, RpnHead, RpnHeadConfig, RpnLoss, RpnOutput};
