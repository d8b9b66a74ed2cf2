//! Vision Transformer (ViT-B/16 in the DeiT-base layout).
//!
//! Parameter names follow the usual `cls_token` / `pos_embed` / `patch_embed` /
//! `blocks.N` / `norm` / `head` layout so PyTorch checkpoints map onto the
//! variables one to one once any wrapper prefix is stripped.

use candle::{IndexOp, Module, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Init, LayerNorm, Linear, VarBuilder};

#[derive(Debug, Clone, PartialEq)]
pub struct ViTConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: usize,
    pub layer_norm_eps: f64,
    pub num_classes: usize,
}

impl ViTConfig {
    pub fn deit_base_patch16_224(num_classes: usize) -> Self {
        Self {
            image_size: 224,
            patch_size: 16,
            embed_dim: 768,
            depth: 12,
            num_heads: 12,
            mlp_ratio: 4,
            layer_norm_eps: 1e-6,
            num_classes,
        }
    }

    pub fn num_patches(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }
}

#[derive(Debug)]
struct PatchEmbed {
    proj: Conv2d,
}

impl PatchEmbed {
    fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let proj = candle_nn::conv2d(3, cfg.embed_dim, cfg.patch_size, conv_cfg, vb.pp("proj"))?;
        Ok(Self { proj })
    }
}

impl Module for PatchEmbed {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // [b, c, h, w] -> [b, h*w, c]
        self.proj.forward(xs)?.flatten_from(2)?.transpose(1, 2)
    }
}

#[derive(Debug)]
struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let head_dim = dim / cfg.num_heads;
        Ok(Self {
            qkv: candle_nn::linear(dim, dim * 3, vb.pp("qkv"))?,
            proj: candle_nn::linear(dim, dim, vb.pp("proj"))?,
            num_heads: cfg.num_heads,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, c / self.num_heads))?
            .permute((2, 0, 3, 1, 4))?;
        let q = (qkv.i(0)?.contiguous()? * self.scale)?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let attn = candle_nn::ops::softmax_last_dim(&q.matmul(&k.t()?)?)?;
        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        self.proj.forward(&out)
    }
}

#[derive(Debug)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.embed_dim * cfg.mlp_ratio;
        Ok(Self {
            fc1: candle_nn::linear(cfg.embed_dim, hidden, vb.pp("fc1"))?,
            fc2: candle_nn::linear(hidden, cfg.embed_dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)
    }
}

#[derive(Debug)]
struct Block {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.layer_norm_eps;
        Ok(Self {
            norm1: candle_nn::layer_norm(cfg.embed_dim, eps, vb.pp("norm1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            norm2: candle_nn::layer_norm(cfg.embed_dim, eps, vb.pp("norm2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.norm1.forward(xs)?)?)?;
        &xs + self.mlp.forward(&self.norm2.forward(&xs)?)?
    }
}

/// Image classifier network: patch embedding, transformer blocks, class-token head.
#[derive(Debug)]
pub struct VisionTransformer {
    patch_embed: PatchEmbed,
    cls_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,
    head: Linear,
}

impl VisionTransformer {
    pub fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let init = Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };
        let cls_token = vb.get_with_hints((1, 1, cfg.embed_dim), "cls_token", init)?;
        let pos_embed =
            vb.get_with_hints((1, cfg.num_patches() + 1, cfg.embed_dim), "pos_embed", init)?;

        let vb_blocks = vb.pp("blocks");
        let blocks = (0..cfg.depth)
            .map(|i| Block::new(cfg, vb_blocks.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patch_embed: PatchEmbed::new(cfg, vb.pp("patch_embed"))?,
            cls_token,
            pos_embed,
            blocks,
            norm: candle_nn::layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm"))?,
            head: candle_nn::linear(cfg.embed_dim, cfg.num_classes, vb.pp("head"))?,
        })
    }
}

impl Module for VisionTransformer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let patches = self.patch_embed.forward(xs)?;
        let (b, _, dim) = patches.dims3()?;
        let cls = self.cls_token.expand((b, 1, dim))?;
        let mut xs = Tensor::cat(&[&cls, &patches], 1)?.broadcast_add(&self.pos_embed)?;
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        let xs = self.norm.forward(&xs)?;
        self.head.forward(&xs.i((.., 0))?)
    }
}

/// Softmax over the class dimension of a `[b, classes]` logit tensor.
pub fn class_probabilities(logits: &Tensor) -> Result<Tensor> {
    candle_nn::ops::softmax(logits, D::Minus1)
}
