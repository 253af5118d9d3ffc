use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
  #[default]
  Int8,
  Int16,
  Fp16,
}

impl DType {
  pub fn size(self) -> usize {
    match self {
      DType::Int8 => 1,
      DType::Int16 | DType::Fp16 => 2,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
  Nchw,
  #[default]
  Nhwc,
}

/// Addresses a tensor held in an on-chip buffer. It never owns data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct TensorDescriptor {
  pub base_addr: u32,
  pub n: u32,
  pub c: u32,
  pub h: u32,
  pub w: u32,
  pub dtype: DType,
  pub layout: Layout,
  /// Q16.16 fixed point
  pub scale: i32,
  pub zero_point: i8,
}

impl TensorDescriptor {
  pub fn int8_hwc(base_addr: u32, h: u32, w: u32, c: u32) -> Self {
    Self {
      base_addr,
      n: 1,
      c,
      h,
      w,
      dtype: DType::Int8,
      layout: Layout::Nhwc,
      scale: 1 << 16,
      zero_point: 0,
    }
  }

  pub fn elements(&self) -> usize {
    self.n as usize * self.c as usize * self.h as usize * self.w as usize
  }

  pub fn bytes(&self) -> usize {
    self.elements() * self.dtype.size()
  }

  /// Element index of (n, c, h, w) within the tensor
  pub fn index(&self, n: u32, c: u32, h: u32, w: u32) -> usize {
    let (n, c, h, w) = (n as usize, c as usize, h as usize, w as usize);
    let (cs, hs, ws) = (self.c as usize, self.h as usize, self.w as usize);
    match self.layout {
      Layout::Nchw => ((n * cs + c) * hs + h) * ws + w,
      Layout::Nhwc => ((n * hs + h) * ws + w) * cs + c,
    }
  }

  /// Buffer byte address of (n, c, h, w)
  pub fn addr(&self, n: u32, c: u32, h: u32, w: u32) -> usize {
    self.base_addr as usize + self.index(n, c, h, w) * self.dtype.size()
  }
}
