//! Dry-run kernel inventory.
//!
//! In dry-run mode every kernel invocation is recorded here, successful or
//! not, so a sweep over input shapes can report which kernel/shape pairs the
//! device library covers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::kernel::{KernelKind, KernelShape};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryEntry {
    pub kernel: KernelKind,
    pub shape: KernelShape,
    pub ok: bool,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
pub struct KernelInventory {
    entries: Mutex<Vec<InventoryEntry>>,
}

impl KernelInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ok(&self, kernel: KernelKind, shape: KernelShape) {
        self.entries.lock().push(InventoryEntry {
            kernel,
            shape,
            ok: true,
            message: None,
        });
    }

    pub fn record_failure(&self, kernel: KernelKind, shape: KernelShape, message: String) {
        self.entries.lock().push(InventoryEntry {
            kernel,
            shape,
            ok: false,
            message: Some(message),
        });
    }

    pub fn entries(&self) -> Vec<InventoryEntry> {
        self.entries.lock().clone()
    }

    pub fn failures(&self) -> Vec<InventoryEntry> {
        self.entries.lock().iter().filter(|e| !e.ok).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Aggregate entries per kernel.
    pub fn report(&self) -> CoverageReport {
        let entries = self.entries.lock();
        let mut report = CoverageReport::default();
        for e in entries.iter() {
            report.invocations += 1;
            let k = report.kernels.entry(e.kernel.name().to_string()).or_default();
            k.invocations += 1;
            k.shapes.insert(e.shape.to_string());
            if !e.ok {
                report.failures += 1;
                k.failures += 1;
                if let Some(msg) = &e.message {
                    k.errors.insert(msg.clone());
                }
            }
        }
        report
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KernelCoverage {
    pub invocations: usize,
    pub failures: usize,
    pub shapes: BTreeSet<String>,
    pub errors: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoverageReport {
    pub invocations: usize,
    pub failures: usize,
    pub kernels: BTreeMap<String, KernelCoverage>,
}

impl fmt::Display for CoverageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} kernel invocations, {} failed",
            self.invocations, self.failures
        )?;
        for (name, k) in &self.kernels {
            writeln!(
                f,
                "  {:<10} calls={:<5} failed={:<5} shapes={}",
                name,
                k.invocations,
                k.failures,
                k.shapes.len()
            )?;
            for err in &k.errors {
                writeln!(f, "    ! {err}")?;
            }
        }
        Ok(())
    }
}
