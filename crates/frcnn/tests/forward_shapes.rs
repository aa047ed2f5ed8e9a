use approx::assert_relative_eq;
use burn::backend::ndarray::NdArray;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::{backend::Backend, Distribution, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::SeedableRng;

use detection_core::{AnchorConfig, BoundingBox, GtBox, Proposal, ShapeError};
use frcnn::{
    Backbone, FasterRcnn, FasterRcnnConfig, RcnnHead, RcnnHeadConfig, RoiPool, RoiPoolConfig,
    RpnHead, RpnHeadConfig,
};

type TestBackend = NdArray<f32>;

/// Stand-in for the pretrained extractor: a single stride-16 convolution.
struct TestBackbone<B: Backend> {
    conv: Conv2d<B>,
    channels: usize,
}

impl<B: Backend> TestBackbone<B> {
    fn new(channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([3, channels], [1, 1])
            .with_stride([16, 16])
            .init(device);
        Self { conv, channels }
    }
}

impl<B: Backend> Backbone<B> for TestBackbone<B> {
    fn features(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(image)
    }

    fn stride(&self) -> usize {
        16
    }

    fn out_channels(&self) -> usize {
        self.channels
    }
}

fn small_config() -> FasterRcnnConfig {
    FasterRcnnConfig {
        num_classes: 3,
        feature_channels: 8,
        rpn_mid_channels: 16,
        rcnn_hidden: 32,
        ..FasterRcnnConfig::default()
    }
}

fn build_model(config: FasterRcnnConfig) -> FasterRcnn<TestBackend> {
    let device = Default::default();
    let backbone = TestBackbone::<TestBackend>::new(config.feature_channels, &device);
    FasterRcnn::new(config, Box::new(backbone), &device).unwrap()
}

#[test]
fn forward_emits_one_anchor_set_entry_per_cell_and_reference() {
    let model = build_model(small_config());
    let device = Default::default();
    // 224x224 image, stride 16 -> 14x14 grid; 3 scales x 3 ratios = 9
    // reference anchors -> 14 * 14 * 9 = 1764 anchors.
    let image =
        Tensor::<TestBackend, 4>::random([1, 3, 224, 224], Distribution::Default, &device);
    let gt = vec![GtBox {
        rect: BoundingBox::new(100.0, 100.0, 200.0, 200.0),
        class: 1,
    }];

    let bundle = model
        .forward(image, &gt, &mut StdRng::seed_from_u64(11))
        .unwrap();

    assert_eq!(bundle.feature_shape, [1, 8, 14, 14]);
    assert_eq!(bundle.anchors.len(), 1764);
    assert_eq!(bundle.rpn.logits.dims(), [1764]);
    assert_eq!(bundle.rpn.deltas.dims(), [1764, 4]);
    assert_eq!(bundle.rpn_targets.len(), 1764);
    assert_eq!(bundle.rcnn_targets.len(), bundle.proposals.len());
}

#[test]
fn forward_is_deterministic_under_a_fixed_seed() {
    let model = build_model(small_config());
    let device = Default::default();
    let image =
        Tensor::<TestBackend, 4>::random([1, 3, 224, 224], Distribution::Default, &device);
    let gt = vec![GtBox {
        rect: BoundingBox::new(50.0, 60.0, 150.0, 170.0),
        class: 2,
    }];

    let a = model
        .forward(image.clone(), &gt, &mut StdRng::seed_from_u64(5))
        .unwrap();
    let b = model
        .forward(image, &gt, &mut StdRng::seed_from_u64(5))
        .unwrap();

    assert_eq!(a.proposals, b.proposals);
    assert_eq!(a.rpn_targets, b.rpn_targets);
    assert_eq!(a.rcnn_targets, b.rcnn_targets);
}

#[test]
fn batch_of_two_is_rejected() {
    let model = build_model(small_config());
    let device = Default::default();
    let image =
        Tensor::<TestBackend, 4>::random([2, 3, 64, 64], Distribution::Default, &device);
    assert!(model
        .forward(image, &[], &mut StdRng::seed_from_u64(0))
        .is_err());
}

#[test]
fn roi_pool_output_matches_proposal_ordering() {
    let device = Default::default();
    // Channel 0 is all ones, channel 1 all twos; any pooled region must
    // average back to exactly those values.
    let mut raw = vec![1.0f32; 8 * 8];
    raw.extend(std::iter::repeat(2.0).take(8 * 8));
    let features =
        Tensor::<TestBackend, 4>::from_data(TensorData::new(raw, [1, 2, 8, 8]), &device);

    let pool = RoiPool::new(&RoiPoolConfig { output_size: [2, 2] }).unwrap();
    let proposals = vec![
        Proposal {
            rect: BoundingBox::new(0.0, 0.0, 64.0, 64.0),
            score: 0.9,
        },
        Proposal {
            rect: BoundingBox::new(32.0, 32.0, 96.0, 96.0),
            score: 0.8,
        },
    ];

    let pooled = pool.forward(&features, &proposals, 16).unwrap().unwrap();
    assert_eq!(pooled.dims(), [2, 2, 2, 2]);

    let values = pooled.into_data().to_vec::<f32>().unwrap();
    // Both blocks: channel 0 -> 1.0, channel 1 -> 2.0.
    for block in values.chunks_exact(8) {
        for &v in &block[..4] {
            assert_relative_eq!(v, 1.0, max_relative = 1e-5);
        }
        for &v in &block[4..] {
            assert_relative_eq!(v, 2.0, max_relative = 1e-5);
        }
    }
}

#[test]
fn roi_pool_clamps_sub_cell_proposals_to_one_cell() {
    let device = Default::default();
    let features = Tensor::<TestBackend, 4>::random([1, 4, 8, 8], Distribution::Default, &device);
    let pool = RoiPool::new(&RoiPoolConfig { output_size: [7, 7] }).unwrap();

    // 2x3 pixels, far smaller than the 16-pixel feature cell.
    let proposals = vec![Proposal {
        rect: BoundingBox::new(40.0, 40.0, 42.0, 43.0),
        score: 0.5,
    }];
    let pooled = pool.forward(&features, &proposals, 16).unwrap().unwrap();
    assert_eq!(pooled.dims(), [1, 4, 7, 7]);
}

#[test]
fn roi_pool_with_no_proposals_yields_none() {
    let device = Default::default();
    let features = Tensor::<TestBackend, 4>::random([1, 4, 8, 8], Distribution::Default, &device);
    let pool = RoiPool::new(&RoiPoolConfig::default()).unwrap();
    assert!(pool.forward(&features, &[], 16).unwrap().is_none());
}

#[test]
fn rpn_head_rejects_wrong_channel_count() {
    let device = Default::default();
    let head = RpnHead::<TestBackend>::new(
        &RpnHeadConfig {
            in_channels: 4,
            mid_channels: 8,
            num_anchors: 9,
        },
        &device,
    );
    let features = Tensor::<TestBackend, 4>::random([1, 5, 4, 4], Distribution::Default, &device);
    assert!(matches!(
        head.forward(features),
        Err(ShapeError::ChannelMismatch {
            expected: 4,
            actual: 5,
            ..
        })
    ));
}

#[test]
fn rpn_head_rejects_empty_spatial_extent() {
    let device = Default::default();
    let head = RpnHead::<TestBackend>::new(
        &RpnHeadConfig {
            in_channels: 4,
            mid_channels: 8,
            num_anchors: 9,
        },
        &device,
    );
    let features = Tensor::<TestBackend, 4>::zeros([1, 4, 0, 4], &device);
    assert!(matches!(
        head.forward(features),
        Err(ShapeError::EmptySpatialExtent { height: 0, width: 4 })
    ));
}

#[test]
fn rcnn_head_rejects_wrong_pooled_size() {
    let device = Default::default();
    let head = RcnnHead::<TestBackend>::new(
        &RcnnHeadConfig {
            in_features: 16,
            hidden: 8,
            num_classes: 3,
        },
        &device,
    )
    .unwrap();
    // 4 * 3 * 3 = 36 flattened features against the expected 16.
    let pooled = Tensor::<TestBackend, 4>::zeros([1, 4, 3, 3], &device);
    assert!(matches!(
        head.forward(pooled),
        Err(ShapeError::ChannelMismatch {
            expected: 16,
            actual: 36,
            ..
        })
    ));
}

#[test]
fn roi_pool_rejects_empty_feature_map() {
    let device = Default::default();
    let features = Tensor::<TestBackend, 4>::zeros([1, 4, 0, 8], &device);
    let pool = RoiPool::new(&RoiPoolConfig::default()).unwrap();
    let proposals = vec![Proposal {
        rect: BoundingBox::new(0.0, 0.0, 32.0, 32.0),
        score: 0.5,
    }];
    assert!(matches!(
        pool.forward(&features, &proposals, 16),
        Err(ShapeError::EmptySpatialExtent { .. })
    ));
}

#[test]
fn anchor_config_drives_reference_count() {
    let config = FasterRcnnConfig {
        anchors: AnchorConfig {
            scales: vec![1.0, 2.0],
            ratios: vec![1.0],
            ..AnchorConfig::default()
        },
        ..small_config()
    };
    let model = build_model(config);
    let device = Default::default();
    let image =
        Tensor::<TestBackend, 4>::random([1, 3, 64, 64], Distribution::Default, &device);
    let bundle = model
        .forward(image, &[], &mut StdRng::seed_from_u64(0))
        .unwrap();
    assert_eq!(bundle.anchors.len(), 4 * 4 * 2);
}
