//! Prediction heads shared by every decoder layer.
//!
//! The image decoder drives classification, 2D boxes and depth; the BEV decoder drives the
//! BEV center, footprint dimensions and heading. Head and feet points of the predicted box
//! are projected to BEV by one learned calibration layer.

use bevdetr_loss::{
    box_ops::box_cxcywh_to_xyxy, DetectionOutputs, PredictionBundle, DEFAULT_HEADING_BINS,
};
use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::activation,
};

use super::mlp::{Mlp, MlpConfig};

/// Configuration for creating [`DetrHeads`].
#[derive(Config, Debug)]
pub struct DetrHeadsConfig {
    /// Number of object classes, without the "no-object" class.
    pub num_classes: usize,
    /// Width of the decoder hidden states. Default: 256
    #[config(default = "256")]
    pub hidden_dim: usize,
    /// Number of depth bins. Default: 9
    #[config(default = "9")]
    pub num_depth_bins: usize,
    /// Depth covered by one bin. Default: 10.0
    #[config(default = "10.0")]
    pub depth_bin_resolution: f64,
    /// Number of heading bins. Default: 12
    #[config(default = "DEFAULT_HEADING_BINS")]
    pub num_heading_bins: usize,
    /// Emit one bundle per intermediate decoder layer. Default: true
    #[config(default = "true")]
    pub aux_loss: bool,
}

impl DetrHeadsConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DetrHeads<B> {
        self.assertions();

        let hidden = self.hidden_dim;
        DetrHeads {
            class_embed: LinearConfig::new(hidden, self.num_classes + 1).init(device),
            bbox_embed: MlpConfig::new(hidden, hidden, 4)
                .with_num_layers(3)
                .init(device),
            bev_embed: MlpConfig::new(hidden, hidden, 2).init(device),
            dim_embed: MlpConfig::new(hidden, hidden, 2).init(device),
            angle_embed: MlpConfig::new(hidden, hidden, 2 * self.num_heading_bins).init(device),
            depth_bin: LinearConfig::new(hidden, self.num_depth_bins).init(device),
            depth_delta: LinearConfig::new(hidden, 1).init(device),
            calib_cam_to_bev: LinearConfig::new(2, 2).init(device),
            depth_bin_resolution: self.depth_bin_resolution,
            aux_loss: self.aux_loss,
        }
    }

    fn assertions(&self) {
        assert!(self.num_classes > 0, "DetrHeads needs at least one object class");
        assert!(self.hidden_dim > 0, "Hidden dimension of DetrHeads must be positive");
        assert!(self.num_depth_bins > 0, "DetrHeads needs at least one depth bin");
        assert!(self.num_heading_bins > 0, "DetrHeads needs at least one heading bin");
        assert!(
            self.depth_bin_resolution.is_finite() && self.depth_bin_resolution > 0.0,
            "Depth bin resolution must be positive, got {}",
            self.depth_bin_resolution
        );
    }
}

/// Maps decoder hidden states of every layer to [`DetectionOutputs`].
#[derive(Module, Debug)]
pub struct DetrHeads<B: Backend> {
    class_embed: Linear<B>,
    bbox_embed: Mlp<B>,
    bev_embed: Mlp<B>,
    dim_embed: Mlp<B>,
    angle_embed: Mlp<B>,
    /// Raw depth-bin logits; the depth loss normalizes them with `log_softmax`.
    depth_bin: Linear<B>,
    depth_delta: Linear<B>,
    /// Shared projection of image points to BEV. Head and feet points are the top-center
    /// `(mid_x, y0)` and bottom-center `(mid_x, y1)` of the corner form of the predicted box.
    calib_cam_to_bev: Linear<B>,
    depth_bin_resolution: f64,
    aux_loss: bool,
}

impl<B: Backend> DetrHeads<B> {
    /// # Shapes
    /// - image_states: `[num_layers, batch_size, num_queries, hidden_dim]`
    /// - bev_states: `[num_layers, batch_size, num_queries, hidden_dim]`
    ///
    /// # Panics
    ///
    /// Panics if the two decoders disagree on shape or produced no layer.
    pub fn forward(
        &self,
        image_states: Tensor<B, 4>,
        bev_states: Tensor<B, 4>,
    ) -> DetectionOutputs<B> {
        let dims = image_states.dims();
        assert_eq!(
            dims,
            bev_states.dims(),
            "Image and BEV decoder states must have the same shape"
        );
        let num_layers = dims[0];
        assert!(num_layers > 0, "Decoder produced no layer");

        let class_logits = self.class_embed.forward(image_states.clone());
        let boxes = activation::sigmoid(self.bbox_embed.forward(image_states.clone()));
        let depth_bin_logits = self.depth_bin.forward(image_states.clone());
        let depth_delta = activation::tanh(self.depth_delta.forward(image_states))
            .mul_scalar(self.depth_bin_resolution / 2.0);
        let (head_bev, feet_bev) = self.project_points(boxes.clone());

        let bev = activation::sigmoid(self.bev_embed.forward(bev_states.clone()));
        let dimension = self.dim_embed.forward(bev_states.clone());
        let orientation = self.angle_embed.forward(bev_states);

        let bundle = |index: usize| PredictionBundle {
            class_logits: Some(layer(class_logits.clone(), index)),
            boxes: Some(layer(boxes.clone(), index)),
            bev: Some(layer(bev.clone(), index)),
            head_bev: Some(layer(head_bev.clone(), index)),
            feet_bev: Some(layer(feet_bev.clone(), index)),
            dimension: Some(layer(dimension.clone(), index)),
            orientation: Some(layer(orientation.clone(), index)),
            depth_bin_logits: Some(layer(depth_bin_logits.clone(), index)),
            depth_delta: Some(layer(depth_delta.clone(), index)),
            masks: None,
        };

        let outputs = DetectionOutputs::new(bundle(num_layers - 1));
        if self.aux_loss {
            outputs.with_aux_layers((0..num_layers - 1).map(bundle).collect())
        } else {
            outputs
        }
    }

    /// BEV projections of the top-center and bottom-center points of `boxes`.
    fn project_points(&self, boxes: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let corners = box_cxcywh_to_xyxy(boxes);
        let mid_x =
            (corners.clone().narrow(3, 0, 1) + corners.clone().narrow(3, 2, 1)).mul_scalar(0.5);
        let head = Tensor::cat(vec![mid_x.clone(), corners.clone().narrow(3, 1, 1)], 3);
        let feet = Tensor::cat(vec![mid_x, corners.narrow(3, 3, 1)], 3);

        (
            activation::sigmoid(self.calib_cam_to_bev.forward(head)),
            activation::sigmoid(self.calib_cam_to_bev.forward(feet)),
        )
    }
}

fn layer<B: Backend>(states: Tensor<B, 4>, index: usize) -> Tensor<B, 3> {
    let [_, batch_size, num_queries, channels] = states.dims();
    states
        .narrow(0, index, 1)
        .reshape([batch_size, num_queries, channels])
}

#[cfg(test)]
mod tests {
    use burn::tensor::{ops::FloatElem, Distribution, ElementConversion, Tolerance};

    use super::*;
    use crate::tests::TestBackend;

    type FT = FloatElem<TestBackend>;

    fn states(device: &Device<TestBackend>) -> Tensor<TestBackend, 4> {
        Tensor::random([3, 2, 5, 16], Distribution::Normal(0.0, 1.0), device)
    }

    #[test]
    fn heads_fill_every_detection_field() {
        let device = Default::default();
        let heads = DetrHeadsConfig::new(4)
            .with_hidden_dim(16)
            .init::<TestBackend>(&device);

        let outputs = heads.forward(states(&device), states(&device));
        let bundle = &outputs.final_layer;

        assert_eq!(outputs.aux_layers.len(), 2);
        assert_eq!(bundle.batch_shape(), Some([2, 5]));
        assert!(bundle.validate().is_ok());
        assert_eq!(bundle.class_logits.as_ref().map(Tensor::dims), Some([2, 5, 5]));
        assert_eq!(bundle.orientation.as_ref().map(Tensor::dims), Some([2, 5, 24]));
        assert_eq!(bundle.depth_bin_logits.as_ref().map(Tensor::dims), Some([2, 5, 9]));
        assert_eq!(bundle.depth_delta.as_ref().map(Tensor::dims), Some([2, 5, 1]));
        assert_eq!(bundle.head_bev.as_ref().map(Tensor::dims), Some([2, 5, 2]));
        assert!(bundle.masks.is_none());
    }

    #[test]
    fn heads_without_aux_loss_keep_only_last_layer() {
        let device = Default::default();
        let heads = DetrHeadsConfig::new(2)
            .with_hidden_dim(16)
            .with_aux_loss(false)
            .init::<TestBackend>(&device);

        let outputs = heads.forward(states(&device), states(&device));

        assert!(outputs.aux_layers.is_empty());
    }

    #[test]
    fn depth_delta_stays_inside_half_bin() {
        let device = Default::default();
        let heads = DetrHeadsConfig::new(2)
            .with_hidden_dim(16)
            .with_depth_bin_resolution(4.0)
            .init::<TestBackend>(&device);

        let scaled = states(&device).mul_scalar(100.0);
        let outputs = heads.forward(scaled.clone(), scaled);
        let delta = outputs
            .final_layer
            .depth_delta
            .expect("depth delta head")
            .abs()
            .max()
            .into_scalar()
            .elem::<f32>();

        assert!(delta <= 2.0);
    }

    #[test]
    fn normalized_heads_stay_in_unit_range() {
        let device = Default::default();
        let heads = DetrHeadsConfig::new(2)
            .with_hidden_dim(16)
            .init::<TestBackend>(&device);

        let outputs = heads.forward(states(&device), states(&device));
        for tensor in [
            outputs.final_layer.boxes,
            outputs.final_layer.bev,
            outputs.final_layer.feet_bev,
        ] {
            let tensor = tensor.expect("normalized head");
            assert!(tensor.clone().min().into_scalar().elem::<f32>() >= 0.0);
            assert!(tensor.max().into_scalar().elem::<f32>() <= 1.0);
        }
    }

    #[test]
    fn depth_bins_are_raw_logits_and_points_use_box_corners() {
        let device = Default::default();
        let heads = DetrHeadsConfig::new(2)
            .with_hidden_dim(16)
            .with_aux_loss(false)
            .init::<TestBackend>(&device);

        let image = states(&device);
        let last = layer(image.clone(), 2);
        let outputs = heads.forward(image, states(&device));
        let bundle = outputs.final_layer;

        let boxes = bundle.boxes.expect("box head");
        let corners = box_cxcywh_to_xyxy(boxes);
        let mid_x =
            (corners.clone().narrow(2, 0, 1) + corners.clone().narrow(2, 2, 1)).mul_scalar(0.5);
        let head = Tensor::cat(vec![mid_x.clone(), corners.clone().narrow(2, 1, 1)], 2);
        let feet = Tensor::cat(vec![mid_x, corners.narrow(2, 3, 1)], 2);

        bundle
            .head_bev
            .expect("head point")
            .into_data()
            .assert_approx_eq::<FT>(
                &activation::sigmoid(heads.calib_cam_to_bev.forward(head)).into_data(),
                Tolerance::default(),
            );
        bundle
            .feet_bev
            .expect("feet point")
            .into_data()
            .assert_approx_eq::<FT>(
                &activation::sigmoid(heads.calib_cam_to_bev.forward(feet)).into_data(),
                Tolerance::default(),
            );
        bundle
            .depth_bin_logits
            .expect("depth bins")
            .into_data()
            .assert_approx_eq::<FT>(
                &heads.depth_bin.forward(last).into_data(),
                Tolerance::default(),
            );
    }

    #[test]
    #[should_panic = "Image and BEV decoder states must have the same shape"]
    fn heads_reject_mismatched_decoders() {
        let device = Default::default();
        let heads = DetrHeadsConfig::new(2)
            .with_hidden_dim(16)
            .init::<TestBackend>(&device);

        let image = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 16], &device);
        let bev = Tensor::<TestBackend, 4>::zeros([2, 1, 3, 16], &device);
        let _outputs = heads.forward(image, bev);
    }
}
