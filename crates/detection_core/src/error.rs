use thiserror::Error;

/// Rejected configuration, raised at component construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("anchor base size must be positive and finite, got {0}")]
    InvalidBaseSize(f32),
    #[error("anchor scale must be positive and finite, got {0}")]
    InvalidScale(f32),
    #[error("anchor ratio must be positive and finite, got {0}")]
    InvalidRatio(f32),
    #[error("anchor scales and ratios must be non-empty")]
    EmptyAnchorSet,
    #[error("feature stride must be positive")]
    InvalidStride,
    #[error("iou threshold out of range [0, 1]: {0}")]
    InvalidIouThreshold(f32),
    #[error("negative iou threshold {negative} exceeds positive threshold {positive}")]
    InvertedIouThresholds { positive: f32, negative: f32 },
    #[error("minimum proposal size must be non-negative, got {0}")]
    InvalidMinSize(f32),
    #[error("negative sampling ratio must be positive, got {0}")]
    InvalidNegativeRatio(f32),
    #[error("score threshold out of range [0, 1]: {0}")]
    InvalidScoreThreshold(f32),
    #[error("model must have at least one foreground class")]
    NoClasses,
    #[error("feature channel count must be non-zero")]
    NoFeatureChannels,
    #[error("pooled output size must be non-zero in both dimensions")]
    InvalidPooledSize,
    #[error("loss weight must be non-negative and finite, got {0}")]
    InvalidLossWeight(f32),
    #[error("classifier input size {expected} does not match pooled feature size {actual}")]
    PooledSizeMismatch { expected: usize, actual: usize },
    #[error("backbone reports {actual} output channels, config expects {expected}")]
    BackboneChannelMismatch { expected: usize, actual: usize },
    #[error("backbone reports stride {actual}, config expects {expected}")]
    BackboneStrideMismatch { expected: usize, actual: usize },
}

/// Mismatched shapes between collaborating components, raised at the point
/// where the mismatch is first observable rather than deep in a numeric op.
#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("expected {expected} {what}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what}: expected {expected} channels, got {actual}")]
    ChannelMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("feature map has empty spatial extent ({height}x{width})")]
    EmptySpatialExtent { height: usize, width: usize },
    #[error("expected batch size 1, got {0}")]
    BatchSize(usize),
    #[error("ground-truth class {class} outside 1..={num_classes}")]
    ClassOutOfRange { class: u32, num_classes: usize },
}
