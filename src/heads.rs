use burn::{
    nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu, Sigmoid},
    prelude::*,
    tensor::backend::Backend,
};

/// flatten -> dropout -> dense + relu -> dense + sigmoid.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    dropout: Dropout,
    fc1: Linear<B>,
    fc2: Linear<B>,
    relu: Relu,
    sigmoid: Sigmoid,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn new(
        in_features: usize,
        hidden_features: usize,
        dropout_rate: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            dropout: DropoutConfig::new(dropout_rate).init(),
            fc1: LinearConfig::new(in_features, hidden_features).init(device),
            fc2: LinearConfig::new(hidden_features, 1).init(device),
            relu: Relu::new(),
            sigmoid: Sigmoid::new(),
        }
    }

    /// Takes a `[batch, c, h, w]` feature map, returns `[batch, 1]` P(cat).
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x: Tensor<B, 2> = features.flatten(1, 3);
        let x = self.dropout.forward(x);
        let x = self.relu.forward(self.fc1.forward(x));
        self.sigmoid.forward(self.fc2.forward(x))
    }
}
