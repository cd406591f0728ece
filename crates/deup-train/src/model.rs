//! Predictor networks built with tch-rs.
//!
//! Every network implements [`Predictor`]: a forward pass with an optional
//! side-channel feature vector, plus ownership of the `nn::VarStore` holding
//! its trainable parameters. Concrete variants are picked at construction:
//!
//! | type             | input          | side channel | output                |
//! |------------------|----------------|--------------|-----------------------|
//! | [`Mlp`]          | `[B, ...]`     | none         | `[B, output_dim]`     |
//! | [`ResNet18Plus`] | `[B, 3, H, W]` | none         | `[B, classes]` ∈ (0,1) |
//! | [`FusedResNet`]  | `[B, 3, H, W]` | `[B, k]`     | `[B, num_outputs]`    |
//!
//! ```text
//! FusedResNet
//!
//! image ─► stem ─► layer1..4 ─► avgpool ─► linear1 ─► ReLU ─┐
//!                                                           cat ─► linear2 ─► ReLU ─► linear3 ─► (softplus)
//! side features [B, k] ─────────────────────────────────────┘
//! ```
//!
//! Weights are initialised from scratch with tch's defaults (Kaiming uniform).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::nn::{self, Module, ModuleT};
use tch::{Device, Kind, Tensor};

use crate::error::{DeupError, DeupResult};
use crate::tensor::flatten_rows;

// ---------------------------------------------------------------------------
// Predictor trait
// ---------------------------------------------------------------------------

/// A differentiable network with its own parameter store.
pub trait Predictor {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Forward pass. `train` switches batch-norm layers to batch statistics.
    ///
    /// # Errors
    ///
    /// [`DeupError::ShapeMismatch`] when `xs` or `side` do not fit the
    /// network.
    fn forward_t(&self, xs: &Tensor, side: Option<&Tensor>, train: bool) -> DeupResult<Tensor>;

    /// Width of the side-channel vector, `0` when none is accepted.
    fn side_channel_width(&self) -> usize {
        0
    }

    /// Flattened input width for vector inputs; `None` for image backbones.
    fn input_width(&self) -> Option<usize> {
        None
    }

    /// Number of output columns.
    fn output_width(&self) -> usize;

    /// Parameter store (e.g. to build an optimizer).
    fn var_store(&self) -> &nn::VarStore;

    /// Mutable parameter store.
    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    /// Forward pass in inference mode without gradient tracking.
    fn forward_inference(&self, xs: &Tensor, side: Option<&Tensor>) -> DeupResult<Tensor> {
        tch::no_grad(|| self.forward_t(xs, side, false))
    }

    /// Device the parameters live on.
    fn device(&self) -> Device {
        self.var_store().device()
    }

    /// Save weights to `path`.
    fn save(&self, path: &Path) -> DeupResult<()> {
        self.var_store()
            .save(path)
            .map_err(|e| DeupError::checkpoint(format!("cannot save {}: {e}", self.name()), path))
    }

    /// Load weights saved by [`save`](Self::save) from a network of the same
    /// architecture.
    fn load(&mut self, path: &Path) -> DeupResult<()> {
        let name = self.name().to_string();
        self.var_store_mut()
            .load(path)
            .map_err(|e| DeupError::checkpoint(format!("cannot load {name}: {e}"), path))
    }

    /// Count trainable parameters.
    fn num_parameters(&self) -> usize {
        self.var_store().trainable_variables().iter().map(|t| t.numel() as usize).sum()
    }
}

fn reject_side(name: &str, side: Option<&Tensor>) -> DeupResult<()> {
    match side {
        Some(s) => {
            tracing::debug!("{name} received an unexpected side channel");
            Err(DeupError::shape_mismatch(vec![0], vec![s.size().last().copied().unwrap_or(0)]))
        }
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Mlp
// ---------------------------------------------------------------------------

/// Hidden-layer non-linearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// `max(0, x)`.
    Relu,
    /// Hyperbolic tangent.
    Tanh,
    /// Exponential linear unit.
    Elu,
}

impl Activation {
    fn apply(self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Relu => xs.relu(),
            Activation::Tanh => xs.tanh(),
            Activation::Elu => xs.elu(),
        }
    }
}

/// Transform applied to the last layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputActivation {
    /// Raw outputs (logits, regression values).
    Identity,
    /// Outputs in `(0, 1)`; required when the loss is BCE.
    Sigmoid,
    /// Strictly positive outputs.
    Softplus,
}

impl OutputActivation {
    fn apply(self, xs: Tensor) -> Tensor {
        match self {
            OutputActivation::Identity => xs,
            OutputActivation::Sigmoid => xs.sigmoid(),
            OutputActivation::Softplus => xs.softplus(),
        }
    }
}

/// Shape of an [`Mlp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpSpec {
    /// Flattened input width.
    pub input_dim: usize,
    /// Output width.
    pub output_dim: usize,
    /// Units per hidden layer.
    pub hidden_size: usize,
    /// Number of hidden layers (at least one).
    pub n_hidden: usize,
    /// Hidden non-linearity.
    pub activation: Activation,
    /// Output transform.
    pub output: OutputActivation,
}

/// Fully connected network.
pub struct Mlp {
    vs: nn::VarStore,
    layers: Vec<nn::Linear>,
    spec: MlpSpec,
}

impl Mlp {
    /// Build the network on `device`.
    pub fn new(spec: MlpSpec, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let layers = {
            let root = vs.root();
            let mut layers = Vec::with_capacity(spec.n_hidden.max(1) + 1);
            let mut in_dim = spec.input_dim as i64;
            for i in 0..spec.n_hidden.max(1) {
                layers.push(nn::linear(&root / format!("fc{i}"), in_dim, spec.hidden_size as i64, Default::default()));
                in_dim = spec.hidden_size as i64;
            }
            layers.push(nn::linear(&root / "out", in_dim, spec.output_dim as i64, Default::default()));
            layers
        };
        Mlp { vs, layers, spec }
    }

    /// The architecture description.
    pub fn spec(&self) -> &MlpSpec {
        &self.spec
    }
}

impl Predictor for Mlp {
    fn name(&self) -> &str {
        "mlp"
    }

    fn forward_t(&self, xs: &Tensor, side: Option<&Tensor>, _train: bool) -> DeupResult<Tensor> {
        reject_side(self.name(), side)?;
        let flat = flatten_rows(&xs.to_kind(Kind::Float));
        let (batch, width) = (flat.size()[0], flat.size()[1]);
        if width != self.spec.input_dim as i64 {
            return Err(DeupError::shape_mismatch(vec![batch, self.spec.input_dim as i64], vec![batch, width]));
        }
        let (hidden, last) = self.layers.split_at(self.layers.len() - 1);
        let mut h = flat;
        for layer in hidden {
            h = self.spec.activation.apply(&layer.forward(&h));
        }
        Ok(self.spec.output.apply(last[0].forward(&h)))
    }

    fn input_width(&self) -> Option<usize> {
        Some(self.spec.input_dim)
    }

    fn output_width(&self) -> usize {
        self.spec.output_dim
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

// ---------------------------------------------------------------------------
// Residual blocks
// ---------------------------------------------------------------------------

fn conv(p: nn::Path, c_in: i64, c_out: i64, k: i64, stride: i64, padding: i64) -> nn::Conv2D {
    nn::conv2d(p, c_in, c_out, k, nn::ConvConfig { stride, padding, bias: false, ..Default::default() })
}

/// 1x1 projection used when a block changes resolution or width.
fn downsample(p: &nn::Path, c_in: i64, c_out: i64, stride: i64) -> Option<(nn::Conv2D, nn::BatchNorm)> {
    if stride != 1 || c_in != c_out {
        Some((conv(p / "shortcut_conv", c_in, c_out, 1, stride, 0), nn::batch_norm2d(p / "shortcut_bn", c_out, Default::default())))
    } else {
        None
    }
}

fn shortcut(proj: &Option<(nn::Conv2D, nn::BatchNorm)>, xs: &Tensor, train: bool) -> Tensor {
    match proj {
        Some((c, bn)) => xs.apply(c).apply_t(bn, train),
        None => xs.shallow_clone(),
    }
}

/// ResNet BasicBlock.
///
/// ```text
/// x ─── Conv3x3(s) ─── BN ─── ReLU ─── Conv3x3 ─── BN ──+── ReLU
///  │                                                     │
///  └── (1x1 projection if needed) ──────────────────────┘
/// ```
#[derive(Debug)]
struct BasicBlock {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
    proj: Option<(nn::Conv2D, nn::BatchNorm)>,
}

impl BasicBlock {
    const EXPANSION: i64 = 1;

    fn new(p: &nn::Path, c_in: i64, planes: i64, stride: i64) -> Self {
        BasicBlock {
            conv1: conv(p / "conv1", c_in, planes, 3, stride, 1),
            bn1: nn::batch_norm2d(p / "bn1", planes, Default::default()),
            conv2: conv(p / "conv2", planes, planes, 3, 1, 1),
            bn2: nn::batch_norm2d(p / "bn2", planes, Default::default()),
            proj: downsample(p, c_in, planes * Self::EXPANSION, stride),
        }
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let out = xs.apply(&self.conv1).apply_t(&self.bn1, train).relu();
        let out = out.apply(&self.conv2).apply_t(&self.bn2, train);
        (out + shortcut(&self.proj, xs, train)).relu()
    }
}

/// ResNet Bottleneck: 1x1 reduce, 3x3, 1x1 expand by four.
#[derive(Debug)]
struct Bottleneck {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
    conv3: nn::Conv2D,
    bn3: nn::BatchNorm,
    proj: Option<(nn::Conv2D, nn::BatchNorm)>,
}

impl Bottleneck {
    const EXPANSION: i64 = 4;

    fn new(p: &nn::Path, c_in: i64, planes: i64, stride: i64) -> Self {
        Bottleneck {
            conv1: conv(p / "conv1", c_in, planes, 1, 1, 0),
            bn1: nn::batch_norm2d(p / "bn1", planes, Default::default()),
            conv2: conv(p / "conv2", planes, planes, 3, stride, 1),
            bn2: nn::batch_norm2d(p / "bn2", planes, Default::default()),
            conv3: conv(p / "conv3", planes, planes * Self::EXPANSION, 1, 1, 0),
            bn3: nn::batch_norm2d(p / "bn3", planes * Self::EXPANSION, Default::default()),
            proj: downsample(p, c_in, planes * Self::EXPANSION, stride),
        }
    }
}

impl ModuleT for Bottleneck {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let out = xs.apply(&self.conv1).apply_t(&self.bn1, train).relu();
        let out = out.apply(&self.conv2).apply_t(&self.bn2, train).relu();
        let out = out.apply(&self.conv3).apply_t(&self.bn3, train);
        (out + shortcut(&self.proj, xs, train)).relu()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Basic,
    Bottleneck,
}

impl BlockKind {
    fn expansion(self) -> i64 {
        match self {
            BlockKind::Basic => BasicBlock::EXPANSION,
            BlockKind::Bottleneck => Bottleneck::EXPANSION,
        }
    }
}

/// 3x3 stem followed by four residual stages (64, 128, 256, 512 planes).
///
/// Returns the body and its output channel count.
fn resnet_body(p: &nn::Path, kind: BlockKind, num_blocks: [usize; 4]) -> (nn::SequentialT, i64) {
    let mut body = nn::seq_t()
        .add(conv(p / "conv1", 3, 64, 3, 1, 1))
        .add(nn::batch_norm2d(p / "bn1", 64, Default::default()))
        .add_fn(|xs| xs.relu());

    let mut in_planes = 64i64;
    for (stage, (&planes, &n)) in [64i64, 128, 256, 512].iter().zip(num_blocks.iter()).enumerate() {
        let first_stride = if stage == 0 { 1 } else { 2 };
        for b in 0..n {
            let stride = if b == 0 { first_stride } else { 1 };
            let bp = p / format!("layer{}", stage + 1) / b;
            body = match kind {
                BlockKind::Basic => body.add(BasicBlock::new(&bp, in_planes, planes, stride)),
                BlockKind::Bottleneck => body.add(Bottleneck::new(&bp, in_planes, planes, stride)),
            };
            in_planes = planes * kind.expansion();
        }
    }
    (body.add_fn(|xs| xs.adaptive_avg_pool2d([1, 1]).flatten(1, -1)), in_planes)
}

fn check_image(xs: &Tensor) -> DeupResult<()> {
    let size = xs.size();
    if size.len() != 4 || size[1] != 3 {
        return Err(DeupError::shape_mismatch(vec![-1, 3, -1, -1], size));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ResNet18Plus
// ---------------------------------------------------------------------------

/// CIFAR-style ResNet-18: 3x3 stem, no max-pool, sigmoid class scores.
pub struct ResNet18Plus {
    vs: nn::VarStore,
    body: nn::SequentialT,
    fc: nn::Linear,
    num_classes: usize,
}

impl ResNet18Plus {
    /// Build the network on `device`.
    pub fn new(num_classes: usize, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let (body, fc) = {
            let root = vs.root();
            let (body, width) = resnet_body(&(&root / "resnet"), BlockKind::Basic, [2, 2, 2, 2]);
            let fc = nn::linear(&root / "fc", width, num_classes as i64, Default::default());
            (body, fc)
        };
        ResNet18Plus { vs, body, fc, num_classes }
    }
}

impl Predictor for ResNet18Plus {
    fn name(&self) -> &str {
        "resnet18"
    }

    fn forward_t(&self, xs: &Tensor, side: Option<&Tensor>, train: bool) -> DeupResult<Tensor> {
        reject_side(self.name(), side)?;
        check_image(xs)?;
        Ok(xs.to_kind(Kind::Float).apply_t(&self.body, train).apply(&self.fc).sigmoid())
    }

    fn output_width(&self) -> usize {
        self.num_classes
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

// ---------------------------------------------------------------------------
// FusedResNet
// ---------------------------------------------------------------------------

/// Depth of a [`FusedResNet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResNetDepth {
    /// BasicBlock × [2, 2, 2, 2].
    R18,
    /// BasicBlock × [3, 4, 6, 3].
    R34,
    /// Bottleneck × [3, 4, 6, 3].
    R50,
}

impl ResNetDepth {
    fn layout(self) -> (BlockKind, [usize; 4]) {
        match self {
            ResNetDepth::R18 => (BlockKind::Basic, [2, 2, 2, 2]),
            ResNetDepth::R34 => (BlockKind::Basic, [3, 4, 6, 3]),
            ResNetDepth::R50 => (BlockKind::Bottleneck, [3, 4, 6, 3]),
        }
    }
}

/// ResNet with a side-channel vector concatenated before the head.
pub struct FusedResNet {
    vs: nn::VarStore,
    body: nn::SequentialT,
    linear1: nn::Linear,
    linear2: nn::Linear,
    linear3: nn::Linear,
    depth: ResNetDepth,
    num_outputs: usize,
    num_additional_inputs: usize,
    positive_output: bool,
}

impl FusedResNet {
    /// Build the network on `device`.
    ///
    /// With `positive_output` the head ends in a softplus.
    pub fn new(
        depth: ResNetDepth,
        num_outputs: usize,
        positive_output: bool,
        num_additional_inputs: usize,
        device: Device,
    ) -> Self {
        let vs = nn::VarStore::new(device);
        let (body, linear1, linear2, linear3) = {
            let root = vs.root();
            let (kind, blocks) = depth.layout();
            let (body, width) = resnet_body(&(&root / "body"), kind, blocks);
            let linear1 = nn::linear(&root / "linear1", width, 128, Default::default());
            let linear2 = nn::linear(&root / "linear2", 128 + num_additional_inputs as i64, 64, Default::default());
            let linear3 = nn::linear(&root / "linear3", 64, num_outputs as i64, Default::default());
            (body, linear1, linear2, linear3)
        };
        FusedResNet { vs, body, linear1, linear2, linear3, depth, num_outputs, num_additional_inputs, positive_output }
    }

    /// Network depth.
    pub fn depth(&self) -> ResNetDepth {
        self.depth
    }
}

impl Predictor for FusedResNet {
    fn name(&self) -> &str {
        match self.depth {
            ResNetDepth::R18 => "fused_resnet18",
            ResNetDepth::R34 => "fused_resnet34",
            ResNetDepth::R50 => "fused_resnet50",
        }
    }

    fn forward_t(&self, xs: &Tensor, side: Option<&Tensor>, train: bool) -> DeupResult<Tensor> {
        check_image(xs)?;
        let batch = xs.size()[0];
        let k = self.num_additional_inputs as i64;
        let side = match side {
            Some(s) => flatten_rows(&s.to_device(xs.device()).to_kind(Kind::Float)),
            None if k == 0 => Tensor::zeros([batch, 0], (Kind::Float, xs.device())),
            None => return Err(DeupError::shape_mismatch(vec![batch, k], vec![batch, 0])),
        };
        if side.size()[1] != k {
            return Err(DeupError::shape_mismatch(vec![batch, k], side.size()));
        }
        let out = xs.to_kind(Kind::Float).apply_t(&self.body, train).apply(&self.linear1).relu();
        let out = Tensor::cat(&[out, side], 1).apply(&self.linear2).relu().apply(&self.linear3);
        Ok(if self.positive_output { out.softplus() } else { out })
    }

    fn side_channel_width(&self) -> usize {
        self.num_additional_inputs
    }

    fn output_width(&self) -> usize {
        self.num_outputs
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mlp(output: OutputActivation) -> Mlp {
        Mlp::new(
            MlpSpec { input_dim: 4, output_dim: 3, hidden_size: 8, n_hidden: 2, activation: Activation::Relu, output },
            Device::Cpu,
        )
    }

    #[test]
    fn mlp_flattens_its_input() {
        tch::manual_seed(0);
        let net = mlp(OutputActivation::Identity);
        let out = net.forward_t(&Tensor::ones([5, 2, 2], (Kind::Float, Device::Cpu)), None, true).unwrap();
        assert_eq!(out.size(), vec![5, 3]);
    }

    #[test]
    fn mlp_rejects_wrong_width() {
        let net = mlp(OutputActivation::Identity);
        let err = net.forward_t(&Tensor::ones([5, 3], (Kind::Float, Device::Cpu)), None, false).unwrap_err();
        assert!(matches!(err, DeupError::ShapeMismatch { .. }));
    }

    #[test]
    fn mlp_sigmoid_output_is_a_probability() {
        let net = mlp(OutputActivation::Sigmoid);
        let out = net.forward_inference(&Tensor::randn([16, 4], (Kind::Float, Device::Cpu)), None).unwrap();
        assert!(out.min().double_value(&[]) > 0.0);
        assert!(out.max().double_value(&[]) < 1.0);
    }

    #[test]
    fn mlp_save_load_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mlp.ot");
        tch::manual_seed(1);
        let a = mlp(OutputActivation::Identity);
        a.save(&path).unwrap();
        tch::manual_seed(2);
        let mut b = mlp(OutputActivation::Identity);
        b.load(&path).unwrap();
        let x = Tensor::ones([1, 4], (Kind::Float, Device::Cpu));
        let diff = (a.forward_inference(&x, None).unwrap() - b.forward_inference(&x, None).unwrap()).abs().max();
        assert!(diff.double_value(&[]) < 1e-7);
    }

    #[test]
    fn resnet18plus_outputs_class_scores() {
        tch::manual_seed(0);
        let net = ResNet18Plus::new(10, Device::Cpu);
        let out = net.forward_inference(&Tensor::zeros([2, 3, 8, 8], (Kind::Float, Device::Cpu)), None).unwrap();
        assert_eq!(out.size(), vec![2, 10]);
        assert!(net.num_parameters() > 10_000_000);
    }

    #[test]
    fn fused_resnet_uses_side_channel() {
        tch::manual_seed(0);
        let net = FusedResNet::new(ResNetDepth::R18, 1, true, 2, Device::Cpu);
        let x = Tensor::zeros([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let side = Tensor::ones([2, 2], (Kind::Float, Device::Cpu));
        let out = net.forward_inference(&x, Some(&side)).unwrap();
        assert_eq!(out.size(), vec![2, 1]);
        assert!(out.min().double_value(&[]) > 0.0);
        assert!(net.forward_inference(&x, None).is_err());
    }

    #[test]
    fn plain_networks_reject_side_channel() {
        let net = mlp(OutputActivation::Identity);
        let side = Tensor::ones([1, 2], (Kind::Float, Device::Cpu));
        assert!(net.forward_t(&Tensor::ones([1, 4], (Kind::Float, Device::Cpu)), Some(&side), false).is_err());
    }
}
