// Weight-stationary systolic array
// Activations flow left to right, partial sums flow top to bottom

use std::collections::VecDeque;

use super::error::{NpuError, Result};

// ===========================================
// Processing Element (PE) Module
// ===========================================

/// Processing Element (PE) - one stationary weight and one partial sum register
#[derive(Debug, Clone, Default)]
pub struct ProcessingElement {
    /// Stationary weight, written once per tile
    weight: i8,
    /// Partial sum leaving this PE towards the row below
    acc: i32,
    /// Activation leaving this PE towards the column on the right
    data: i8,
    /// Whether `data` carries a real activation rather than a bubble
    data_valid: bool,
}

impl ProcessingElement {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot weight write
    pub fn load_weight(&mut self, weight: i8) {
        self.weight = weight;
    }

    pub fn weight(&self) -> i8 {
        self.weight
    }

    pub fn accumulator(&self) -> i32 {
        self.acc
    }

    /// Perform multiply-accumulate operation (MAC)
    ///
    /// # Arguments
    /// * `data_in` - Activation arriving from the left neighbour, `None` for a bubble
    /// * `psum_in` - Partial sum arriving from the PE above
    ///
    /// # Returns
    /// True if a real multiply was performed
    pub fn compute(&mut self, data_in: Option<i8>, psum_in: i32) -> bool {
        let product = match data_in {
            // int8 x int8 fits in i16; widen before accumulating
            Some(a) => (a as i16 * self.weight as i16) as i32,
            None => 0,
        };
        // tiles are sized so the column sum stays within 32 bits
        self.acc = psum_in.wrapping_add(product);
        self.data = data_in.unwrap_or(0);
        self.data_valid = data_in.is_some();
        data_in.is_some()
    }

    /// Activation to forward to the right neighbour
    pub fn data_out(&self) -> Option<i8> {
        self.data_valid.then_some(self.data)
    }

    /// Zero the partial sum and forwarded activation, keep the weight
    pub fn clear(&mut self) {
        self.acc = 0;
        self.data = 0;
        self.data_valid = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ===========================================
// Systolic Array Main Module
// ===========================================

/// R x C grid of processing elements
///
/// Row `r` of every input vector is delayed by `r` cycles on entry so that a
/// vector's partial sums meet its activations as they travel down each
/// column. The first output of column `c` is registered `R + c` cycles after
/// the first activation enters row 0.
#[derive(Debug, Clone)]
pub struct SystolicArray {
    rows: usize,
    cols: usize,
    /// 2D grid of processing elements indexed by (row, col)
    pe_grid: Vec<Vec<ProcessingElement>>,
    /// Input skew registers, row `r` holds `r` stages
    skew: Vec<VecDeque<Option<i8>>>,
    /// Column output registers below the last row
    outputs: Vec<Option<i32>>,
    cycle_count: u64,
    mac_ops: u64,
}

impl SystolicArray {
    /// Create a new systolic array with specified dimensions
    ///
    /// # Arguments
    /// * `rows` - Reduction depth (number of PE rows)
    /// * `cols` - Number of output columns
    pub fn new(rows: usize, cols: usize) -> Self {
        let pe_grid = (0..rows)
            .map(|_| (0..cols).map(|_| ProcessingElement::new()).collect())
            .collect();
        let skew = (0..rows).map(|r| VecDeque::from(vec![None; r])).collect();

        Self {
            rows,
            cols,
            pe_grid,
            skew,
            outputs: vec![None; cols],
            cycle_count: 0,
            mac_ops: 0,
        }
    }

    /// Load the weights of one PE row
    ///
    /// # Arguments
    /// * `row` - Row index
    /// * `weights` - Up to `cols` weights, missing columns are zero
    pub fn load_weight(&mut self, row: usize, weights: &[i8]) -> Result<()> {
        if row >= self.rows || weights.len() > self.cols {
            return Err(NpuError::AddressOutOfRange {
                buffer: "systolic array",
                addr: row,
                len: weights.len(),
                capacity: self.cols,
            });
        }
        for (col, pe) in self.pe_grid[row].iter_mut().enumerate() {
            pe.load_weight(weights.get(col).copied().unwrap_or(0));
        }
        Ok(())
    }

    /// Advance the array by one cycle
    ///
    /// # Arguments
    /// * `data_in` - Activation vector for the left column, `None` feeds a bubble
    ///
    /// # Returns
    /// The column output registers after this cycle
    pub fn step(&mut self, data_in: Option<&[i8]>) -> &[Option<i32>] {
        let bottom = self.rows - 1;

        // outputs register what the last row held at the start of the cycle
        for (col, out) in self.outputs.iter_mut().enumerate() {
            let pe = &self.pe_grid[bottom][col];
            *out = pe.data_valid.then_some(pe.acc);
        }

        // activations entering each row after the skew stages
        let mut entering = Vec::with_capacity(self.rows);
        for row in 0..self.rows {
            let value = data_in.map(|v| v.get(row).copied().unwrap_or(0));
            if row == 0 {
                entering.push(value);
            } else {
                let stage = &mut self.skew[row];
                stage.push_back(value);
                entering.push(stage.pop_front().flatten());
            }
        }

        // walk bottom-right to top-left so every PE reads last cycle's neighbours
        for row in (0..self.rows).rev() {
            for col in (0..self.cols).rev() {
                let data = if col == 0 {
                    entering[row]
                } else {
                    self.pe_grid[row][col - 1].data_out()
                };
                let psum = if row == 0 { 0 } else { self.pe_grid[row - 1][col].acc };
                if self.pe_grid[row][col].compute(data, psum) {
                    self.mac_ops += 1;
                }
            }
        }

        self.cycle_count += 1;
        &self.outputs
    }

    /// Zero every accumulator and in-flight activation; weights are kept
    pub fn clear_acc(&mut self) {
        for pe in self.pe_grid.iter_mut().flatten() {
            pe.clear();
        }
        for stage in self.skew.iter_mut() {
            stage.iter_mut().for_each(|slot| *slot = None);
        }
        self.outputs.iter_mut().for_each(|out| *out = None);
    }

    /// Reset the systolic array to initial state
    pub fn reset(&mut self) {
        for pe in self.pe_grid.iter_mut().flatten() {
            pe.reset();
        }
        self.clear_acc();
        self.cycle_count = 0;
        self.mac_ops = 0;
    }

    /// True when no activation is travelling through the grid
    pub fn is_drained(&self) -> bool {
        let grid_empty = self.pe_grid.iter().flatten().all(|pe| !pe.data_valid);
        let skew_empty = self.skew.iter().flatten().all(|slot| slot.is_none());
        grid_empty && skew_empty
    }

    pub fn accumulator(&self, row: usize, col: usize) -> i32 {
        self.pe_grid[row][col].accumulator()
    }

    pub fn weight(&self, row: usize, col: usize) -> i8 {
        self.pe_grid[row][col].weight()
    }

    pub fn outputs(&self) -> &[Option<i32>] {
        &self.outputs
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn mac_ops(&self) -> u64 {
        self.mac_ops
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }
}
