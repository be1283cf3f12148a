//! Dense row-major tensors and shared parameters.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether operations on this thread record gradient tapes.
pub fn grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

/// Run `f` with gradient recording switched on or off, restoring the
/// previous mode afterwards.
pub fn with_grad_mode<R>(enabled: bool, f: impl FnOnce() -> R) -> R {
    let previous = GRAD_ENABLED.with(|cell| cell.replace(enabled));
    let result = f();
    GRAD_ENABLED.with(|cell| cell.set(previous));
    result
}

/// Parameter gradients produced by a backward pass.
pub type ParamGrads = Vec<(CpuParameter, Vec<f64>)>;

/// Maps the gradient of a module output to gradients of its parameters.
pub type GradFn = Arc<dyn Fn(&[f64]) -> ParamGrads + Send + Sync>;

/// One-level gradient record.
#[derive(Clone)]
pub enum Tape {
    /// Tensor produced by a module; turns an upstream gradient into
    /// parameter gradients.
    Output(GradFn),
    /// Scalar loss with its parameter gradients already computed.
    Loss(Arc<ParamGrads>),
}

/// A row-major `rows x cols` matrix of `f64`.
#[derive(Clone)]
pub struct CpuTensor {
    data: Vec<f64>,
    rows: usize,
    cols: usize,
    tape: Option<Tape>,
}

impl CpuTensor {
    pub fn new(data: Vec<f64>, rows: usize, cols: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            data.len() == rows * cols,
            "tensor data has {} values, expected {rows}x{cols}",
            data.len()
        );
        Ok(Self {
            data,
            rows,
            cols,
            tape: None,
        })
    }

    /// A single-row tensor.
    pub fn row(data: Vec<f64>) -> Self {
        let cols = data.len();
        Self {
            data,
            rows: 1,
            cols,
            tape: None,
        }
    }

    /// A single-column tensor.
    pub fn column(data: Vec<f64>) -> Self {
        let rows = data.len();
        Self {
            data,
            rows,
            cols: 1,
            tape: None,
        }
    }

    pub fn scalar(value: f64) -> Self {
        Self::row(vec![value])
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
            tape: None,
        }
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row_slice(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn tape(&self) -> Option<&Tape> {
        self.tape.as_ref()
    }

    pub fn requires_grad(&self) -> bool {
        self.tape.is_some()
    }

    pub(crate) fn with_tape(mut self, tape: Tape) -> Self {
        self.tape = Some(tape);
        self
    }

    /// A copy without gradient history.
    pub fn detach(&self) -> Self {
        Self {
            data: self.data.clone(),
            rows: self.rows,
            cols: self.cols,
            tape: None,
        }
    }
}

impl fmt::Debug for CpuTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuTensor")
            .field("shape", &(self.rows, self.cols))
            .field("data", &self.data)
            .field("requires_grad", &self.requires_grad())
            .finish()
    }
}

impl PartialEq for CpuTensor {
    fn eq(&self, other: &Self) -> bool {
        self.rows == other.rows && self.cols == other.cols && self.data == other.data
    }
}

#[derive(Debug)]
struct ParamSlot {
    name: String,
    value: Vec<f64>,
    grad: Vec<f64>,
}

/// A learnable parameter shared between its module and the optimizer.
#[derive(Clone)]
pub struct CpuParameter(Arc<Mutex<ParamSlot>>);

impl CpuParameter {
    pub fn new(name: impl Into<String>, value: Vec<f64>) -> Self {
        let grad = vec![0.0; value.len()];
        Self(Arc::new(Mutex::new(ParamSlot {
            name: name.into(),
            value,
            grad,
        })))
    }

    fn slot(&self) -> MutexGuard<'_, ParamSlot> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> String {
        self.slot().name.clone()
    }

    pub fn value(&self) -> Vec<f64> {
        self.slot().value.clone()
    }

    pub fn grad(&self) -> Vec<f64> {
        self.slot().grad.clone()
    }

    pub fn len(&self) -> usize {
        self.slot().value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_value(&self, value: &[f64]) -> anyhow::Result<()> {
        let mut slot = self.slot();
        anyhow::ensure!(
            slot.value.len() == value.len(),
            "parameter '{}' has {} values, got {}",
            slot.name,
            slot.value.len(),
            value.len()
        );
        slot.value.copy_from_slice(value);
        Ok(())
    }

    pub fn zero_grad(&self) {
        self.slot().grad.iter_mut().for_each(|g| *g = 0.0);
    }

    pub fn accumulate_grad(&self, grad: &[f64]) {
        let mut slot = self.slot();
        for (acc, g) in slot.grad.iter_mut().zip(grad) {
            *acc += g;
        }
    }

    /// Apply `update(value, grad)` under the parameter lock.
    pub fn update(&self, update: impl FnOnce(&mut [f64], &[f64])) {
        let mut guard = self.slot();
        let slot = &mut *guard;
        update(&mut slot.value, &slot.grad);
    }

    pub fn same_as(&self, other: &CpuParameter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for CpuParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot();
        f.debug_struct("CpuParameter")
            .field("name", &slot.name)
            .field("value", &slot.value)
            .finish()
    }
}
