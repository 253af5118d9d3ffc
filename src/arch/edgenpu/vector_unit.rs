use super::decoder::{ActivationKind, EltwiseKind, NormKind, PoolKind, ReshapeKind};
use super::error::{NpuError, Result};

/// Fixed-point interpretation of int8 codes fed to transcendental activations
const ACT_INPUT_SCALE: f64 = 16.0;
const ACT_OUTPUT_SCALE: f64 = 127.0;

fn sat8(value: i32) -> i8 {
  value.clamp(i8::MIN as i32, i8::MAX as i32) as i8
}

fn sigmoid(x: f64) -> f64 {
  1.0 / (1.0 + (-x).exp())
}

pub fn activate(kind: ActivationKind, x: i8) -> i8 {
  let real = x as f64 / ACT_INPUT_SCALE;
  // float to int casts truncate toward zero and saturate
  let scaled = |v: f64| (v * ACT_OUTPUT_SCALE) as i8;
  match kind {
    ActivationKind::Relu => x.max(0),
    ActivationKind::Relu6 => x.clamp(0, 6),
    ActivationKind::LeakyRelu => {
      if x >= 0 {
        x
      } else {
        x >> 3
      }
    },
    ActivationKind::Sigmoid => scaled(sigmoid(real)),
    ActivationKind::Tanh => scaled(real.tanh()),
    ActivationKind::Swish => scaled(real * sigmoid(real)),
    ActivationKind::Gelu => {
      let inner = (2.0 / std::f64::consts::PI).sqrt() * (real + 0.044715 * real.powi(3));
      scaled(0.5 * real * (1.0 + inner.tanh()))
    },
  }
}

pub fn activate_all(kind: ActivationKind, data: &mut [i8]) {
  for x in data.iter_mut() {
    *x = activate(kind, *x);
  }
}

/// Pooling window geometry over an HWC tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShape {
  pub in_h: usize,
  pub in_w: usize,
  pub channels: usize,
  pub kernel_h: usize,
  pub kernel_w: usize,
  pub stride_h: usize,
  pub stride_w: usize,
}

impl PoolShape {
  /// Output height and width
  pub fn out_dims(&self, kind: PoolKind) -> Result<(usize, usize)> {
    if matches!(kind, PoolKind::GlobalAvg | PoolKind::GlobalMax) {
      return Ok((1, 1));
    }
    let bad = |reason: &str| NpuError::InvalidOperand {
      op: "pool",
      reason: reason.to_string(),
    };
    if self.kernel_h == 0 || self.kernel_w == 0 || self.stride_h == 0 || self.stride_w == 0 {
      return Err(bad("zero kernel or stride"));
    }
    if self.kernel_h > self.in_h || self.kernel_w > self.in_w {
      return Err(bad("kernel larger than input"));
    }
    Ok((
      (self.in_h - self.kernel_h) / self.stride_h + 1,
      (self.in_w - self.kernel_w) / self.stride_w + 1,
    ))
  }
}

/// Pool an HWC tensor. Average pooling truncates toward zero.
pub fn pool(kind: PoolKind, input: &[i8], shape: PoolShape) -> Result<Vec<i8>> {
  let (out_h, out_w) = shape.out_dims(kind)?;
  let c = shape.channels;
  if input.len() < shape.in_h * shape.in_w * c {
    return Err(NpuError::InvalidOperand {
      op: "pool",
      reason: format!("input has {} bytes, need {}", input.len(), shape.in_h * shape.in_w * c),
    });
  }
  let (kh, kw, sh, sw) = match kind {
    PoolKind::GlobalAvg | PoolKind::GlobalMax => (shape.in_h, shape.in_w, 1, 1),
    _ => (shape.kernel_h, shape.kernel_w, shape.stride_h, shape.stride_w),
  };
  let is_max = matches!(kind, PoolKind::Max | PoolKind::GlobalMax);

  let mut out = Vec::with_capacity(out_h * out_w * c);
  for oh in 0..out_h {
    for ow in 0..out_w {
      for ch in 0..c {
        let window = (0..kh).flat_map(|dy| (0..kw).map(move |dx| (oh * sh + dy, ow * sw + dx)));
        let values = window.map(|(y, x)| input[(y * shape.in_w + x) * c + ch] as i32);
        let value = if is_max {
          values.max().unwrap_or(0)
        } else {
          values.sum::<i32>() / (kh * kw).max(1) as i32
        };
        out.push(sat8(value));
      }
    }
  }
  Ok(out)
}

/// Elementwise op over two vectors with int8 saturation. `b` is ignored by ABS.
pub fn elementwise(kind: EltwiseKind, a: &[i8], b: &[i8]) -> Vec<i8> {
  a.iter()
    .enumerate()
    .map(|(i, &x)| {
      let x = x as i32;
      let y = b.get(i).copied().unwrap_or(0) as i32;
      sat8(match kind {
        EltwiseKind::Add => x + y,
        EltwiseKind::Sub => x - y,
        EltwiseKind::Mul => x * y,
        // division by zero yields zero
        EltwiseKind::Div => x.checked_div(y).unwrap_or(0),
        EltwiseKind::Max => x.max(y),
        EltwiseKind::Min => x.min(y),
        EltwiseKind::Abs => x.abs(),
      })
    })
    .collect()
}

/// Per-tensor batchnorm parameters taken from the layer registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormParams {
  /// Q16.16 multiplier
  pub scale: i32,
  pub zero_point: i32,
  pub shift: u32,
  pub bias: i32,
}

pub fn normalize(kind: NormKind, x: &[i8], params: NormParams) -> Vec<i8> {
  if x.is_empty() {
    return Vec::new();
  }
  match kind {
    NormKind::BatchNorm => x
      .iter()
      .map(|&v| {
        let centered = v as i64 - params.zero_point as i64;
        let scaled = (centered * params.scale as i64) >> 16;
        let shifted = (scaled + params.bias as i64) >> params.shift.min(31);
        shifted.clamp(i8::MIN as i64, i8::MAX as i64) as i8
      })
      .collect(),
    NormKind::LayerNorm => {
      let n = x.len() as f64;
      let mean = x.iter().map(|&v| v as f64).sum::<f64>() / n;
      let var = x.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
      let std = (var + 1e-5).sqrt();
      x.iter()
        .map(|&v| ((v as f64 - mean) / std * ACT_INPUT_SCALE) as i8)
        .collect()
    },
    NormKind::Softmax => {
      let max = x.iter().copied().max().unwrap_or(0) as f64;
      let exps: Vec<f64> = x
        .iter()
        .map(|&v| ((v as f64 - max) / ACT_INPUT_SCALE).exp())
        .collect();
      let total: f64 = exps.iter().sum();
      exps.iter().map(|e| (e / total * ACT_OUTPUT_SCALE) as i8).collect()
    },
  }
}

/// Data movement ops. `aux` is the op-specific scalar (rows for TRANSPOSE,
/// pad count for PAD).
pub fn reshape(kind: ReshapeKind, a: &[i8], b: &[i8], aux: usize) -> Result<Vec<i8>> {
  match kind {
    ReshapeKind::Reshape | ReshapeKind::Split => Ok(a.to_vec()),
    ReshapeKind::Concat => Ok(a.iter().chain(b.iter()).copied().collect()),
    ReshapeKind::Pad => {
      let mut out = a.to_vec();
      out.resize(a.len() + aux, 0);
      Ok(out)
    },
    ReshapeKind::Transpose => {
      let rows = aux;
      if rows == 0 || a.len() % rows != 0 {
        return Err(NpuError::InvalidOperand {
          op: "transpose",
          reason: format!("{} elements do not form {} rows", a.len(), rows),
        });
      }
      let cols = a.len() / rows;
      Ok((0..cols).flat_map(|c| (0..rows).map(move |r| a[r * cols + c])).collect())
    },
  }
}
