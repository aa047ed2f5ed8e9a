use burn::tensor::{backend::Backend, Tensor};

/// Feature-extractor boundary.
///
/// The pretrained convolutional backbone is an external collaborator; the
/// detector only relies on this contract: a deterministic map from an NCHW
/// image batch of one to an NCHW feature map whose spatial extent is the
/// image extent divided by `stride()`.
pub trait Backbone<B: Backend> {
    fn features(&self, image: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Image pixels per feature-map cell.
    fn stride(&self) -> usize;

    fn out_channels(&self) -> usize;
}
