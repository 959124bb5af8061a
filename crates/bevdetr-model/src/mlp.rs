use burn::{
    nn::{Linear, LinearConfig, Relu},
    prelude::*,
};

/// Configuration for creating an [`Mlp`].
///
/// `num_layers` linear layers map `input_dim` to `output_dim`; every inner layer has
/// `hidden_dim` features.
#[derive(Config, Debug)]
pub struct MlpConfig {
    input_dim: usize,
    hidden_dim: usize,
    output_dim: usize,
    #[config(default = "2")]
    num_layers: usize,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Mlp<B> {
        assert!(self.num_layers > 0, "Mlp needs at least one layer");

        let mut dims = vec![self.input_dim];
        dims.extend(std::iter::repeat_n(self.hidden_dim, self.num_layers - 1));
        dims.push(self.output_dim);

        let layers = dims
            .windows(2)
            .map(|pair| LinearConfig::new(pair[0], pair[1]).init(device))
            .collect();

        Mlp {
            layers,
            activation: Relu::new(),
        }
    }
}

/// Feed-forward network with ReLU between layers and a linear output.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<Linear<B>>,
    activation: Relu,
}

impl<B: Backend> Mlp<B> {
    /// Applies the layers along the last dimension.
    ///
    /// # Shapes
    /// - input: `[..., input_dim]`
    /// - output: `[..., output_dim]`
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last = self.layers.len() - 1;
        self.layers
            .iter()
            .enumerate()
            .fold(x, |x, (index, layer)| {
                let x = layer.forward(x);
                if index < last {
                    self.activation.forward(x)
                } else {
                    x
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn mlp_maps_last_dimension() {
        let device = Default::default();
        let mlp = MlpConfig::new(8, 16, 3)
            .with_num_layers(3)
            .init::<TestBackend>(&device);

        let output = mlp.forward(Tensor::<TestBackend, 4>::ones([2, 1, 5, 8], &device));

        assert_eq!(output.dims(), [2, 1, 5, 3]);
        assert_eq!(mlp.layers.len(), 3);
    }

    #[test]
    fn single_layer_mlp_is_linear() {
        let device = Default::default();
        let mlp = MlpConfig::new(4, 32, 2)
            .with_num_layers(1)
            .init::<TestBackend>(&device);

        assert_eq!(mlp.layers.len(), 1);
        assert_eq!(
            mlp.forward(Tensor::<TestBackend, 2>::zeros([3, 4], &device))
                .dims(),
            [3, 2]
        );
    }

    #[test]
    #[should_panic = "Mlp needs at least one layer"]
    fn mlp_rejects_zero_layers() {
        let device = Default::default();
        let _mlp = MlpConfig::new(4, 4, 4)
            .with_num_layers(0)
            .init::<TestBackend>(&device);
    }
}
