//! Accumulator drain and requantization.
//!
//! Column sums leave the array as 32-bit values and are reduced to int8 by
//! adding a bias, shifting right and either saturating or wrapping. The shift
//! truncates toward negative infinity and the non-saturating path keeps only
//! the low 8 bits; both match the hardware and are not treated as errors.

use super::error::{NpuError, Result};

const Q16_ONE: i64 = 1 << 16;

/// Reduce one accumulator lane to int8
pub fn requantize(value: i32, bias: i32, shift: u32, saturate: bool) -> i8 {
  let biased = value.wrapping_add(bias);
  let shifted = biased >> shift.min(31);
  if saturate {
    shifted.clamp(i8::MIN as i32, i8::MAX as i32) as i8
  } else {
    shifted as i8
  }
}

/// Scale and zero point of a quantized tensor; scale is Q16.16
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantParams {
  pub scale: i32,
  pub zero_point: i32,
}

impl Default for QuantParams {
  fn default() -> Self {
    Self {
      scale: Q16_ONE as i32,
      zero_point: 0,
    }
  }
}

/// int8 code to a Q16.16 real value
pub fn dequantize(q: i8, params: QuantParams) -> i64 {
  (q as i64 - params.zero_point as i64) * params.scale as i64
}

/// Q16.16 real value back to the accumulator domain, truncating toward zero
pub fn quantize(real: i64, params: QuantParams) -> i32 {
  if params.scale == 0 {
    return params.zero_point;
  }
  let q = real / params.scale as i64 + params.zero_point as i64;
  q.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Lane-parallel drain stage
///
/// Output is produced only when every lane carries a value in the same
/// cycle; a partially fed vector never reaches the output.
#[derive(Debug, Clone)]
pub struct AccumulatorQuantizer {
  lanes: usize,
  drained: u64,
}

impl AccumulatorQuantizer {
  pub fn new(lanes: usize) -> Self {
    Self { lanes, drained: 0 }
  }

  pub fn lanes(&self) -> usize {
    self.lanes
  }

  pub fn drained(&self) -> u64 {
    self.drained
  }

  pub fn drain(&mut self, acc: &[Option<i32>], bias: Option<&[i32]>, shift: u32, saturate: bool) -> Option<Vec<i8>> {
    if acc.len() != self.lanes || acc.iter().any(|lane| lane.is_none()) {
      return None;
    }
    let out = acc
      .iter()
      .enumerate()
      .map(|(lane, value)| {
        let b = bias.and_then(|b| b.get(lane).copied()).unwrap_or(0);
        requantize(value.unwrap_or(0), b, shift, saturate)
      })
      .collect();
    self.drained += 1;
    Some(out)
  }
}

/// 32-bit staging of array outputs, one row per activation vector
#[derive(Debug, Clone, Default)]
pub struct AccumulationBank {
  rows: Vec<Vec<i32>>,
  width: usize,
}

impl AccumulationBank {
  pub fn new() -> Self {
    Self::default()
  }

  /// Prepare for `rows` vectors of `width` lanes. With `keep` the existing
  /// sums are retained so the next tile adds onto them.
  pub fn prepare(&mut self, rows: usize, width: usize, keep: bool) -> Result<()> {
    if keep && !self.rows.is_empty() {
      if self.rows.len() != rows || self.width != width {
        return Err(NpuError::InvalidOperand {
          op: "accumulate",
          reason: format!(
            "tile shape {}x{} does not match accumulated {}x{}",
            rows,
            width,
            self.rows.len(),
            self.width
          ),
        });
      }
      return Ok(());
    }
    self.rows = vec![vec![0; width]; rows];
    self.width = width;
    Ok(())
  }

  /// Add one lane value for vector `row`
  pub fn add(&mut self, row: usize, lane: usize, value: i32) {
    if let Some(slot) = self.rows.get_mut(row).and_then(|r| r.get_mut(lane)) {
      *slot = slot.wrapping_add(value);
    }
  }

  pub fn row(&self, row: usize) -> Option<&[i32]> {
    self.rows.get(row).map(|r| r.as_slice())
  }

  pub fn len(&self) -> usize {
    self.rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  pub fn clear(&mut self) {
    self.rows.clear();
    self.width = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_saturation_boundary() {
    assert_eq!(requantize(200, 0, 0, true), 127);
    assert_eq!(requantize(-200, 0, 0, true), -128);
    assert_eq!(requantize(127, 0, 0, true), 127);
    assert_eq!(requantize(-128, 0, 0, true), -128);
  }

  #[test]
  fn test_wrap_without_saturation() {
    // 200 = 0xC8 keeps its low byte
    assert_eq!(requantize(200, 0, 0, false), -56);
    assert_eq!(requantize(256 + 5, 0, 0, false), 5);
  }

  #[test]
  fn test_shift_truncates_toward_negative_infinity() {
    assert_eq!(requantize(7, 0, 1, true), 3);
    assert_eq!(requantize(-7, 0, 1, true), -4);
    assert_eq!(requantize(-1, 0, 4, true), -1);
    assert_eq!(requantize(1000, 24, 3, true), 127);
    assert_eq!(requantize(100, 28, 3, true), 16);
    assert_eq!(requantize(i32::MIN, 0, 40, true), -1);
  }

  #[test]
  fn test_dequantize_quantize_roundtrip() {
    let mut acc = AccumulatorQuantizer::new(1);
    let params = [
      QuantParams::default(),
      QuantParams {
        scale: 1 << 15,
        zero_point: 3,
      },
      QuantParams {
        scale: 5 << 16,
        zero_point: -10,
      },
    ];
    for p in params {
      for x in i8::MIN..=i8::MAX {
        let value = quantize(dequantize(x, p), p);
        assert_eq!(acc.drain(&[Some(value)], None, 0, false), Some(vec![x]));
      }
    }
  }

  #[test]
  fn test_drain_gating() {
    let mut acc = AccumulatorQuantizer::new(3);
    assert_eq!(acc.drain(&[Some(1), None, Some(3)], None, 0, true), None);
    assert_eq!(acc.drain(&[Some(1), Some(2)], None, 0, true), None);
    assert_eq!(acc.drained(), 0);

    let out = acc.drain(&[Some(10), Some(20), Some(-300)], Some(&[1, -4, 0]), 1, true);
    assert_eq!(out, Some(vec![5, 8, -128]));
    assert_eq!(acc.drained(), 1);
  }

  #[test]
  fn test_accumulation_bank() {
    let mut bank = AccumulationBank::new();
    bank.prepare(2, 2, false).unwrap();
    bank.add(0, 1, 5);
    bank.add(1, 0, -2);

    bank.prepare(2, 2, true).unwrap();
    bank.add(0, 1, 5);
    assert_eq!(bank.row(0), Some(&[0, 10][..]));
    assert!(bank.prepare(3, 2, true).is_err());

    bank.prepare(2, 2, false).unwrap();
    assert_eq!(bank.row(1), Some(&[0, 0][..]));
  }
}
