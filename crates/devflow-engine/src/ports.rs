//! Bounded port pools for workflow dev servers.
//!
//! Allocation is mutex-guarded and persisted on the workflow row by the
//! engine; startup reconciles the in-memory pools against live workflows so
//! a crash cannot leak ports permanently.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Mutex;

use devflow_config::PortRanges;

use crate::EngineError;

struct Pool {
    range: RangeInclusive<u16>,
    allocated: BTreeSet<u16>,
}

impl Pool {
    fn allocate(&mut self) -> Option<u16> {
        let port = self
            .range
            .clone()
            .find(|port| !self.allocated.contains(port))?;
        self.allocated.insert(port);
        Some(port)
    }
}

/// The backend and frontend pools.
pub struct PortAllocator {
    backend: Mutex<Pool>,
    frontend: Mutex<Pool>,
}

impl PortAllocator {
    #[must_use]
    pub fn new(ranges: &PortRanges) -> Self {
        Self {
            backend: Mutex::new(Pool {
                range: ranges.backend[0]..=ranges.backend[1],
                allocated: BTreeSet::new(),
            }),
            frontend: Mutex::new(Pool {
                range: ranges.frontend[0]..=ranges.frontend[1],
                allocated: BTreeSet::new(),
            }),
        }
    }

    pub fn allocate_backend(&self) -> Result<u16, EngineError> {
        self.backend
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .allocate()
            .ok_or(EngineError::ResourceExhausted { pool: "backend" })
    }

    pub fn allocate_frontend(&self) -> Result<u16, EngineError> {
        self.frontend
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .allocate()
            .ok_or(EngineError::ResourceExhausted { pool: "frontend" })
    }

    /// Release bindings at workflow termination. Unknown ports are ignored,
    /// which makes release idempotent.
    pub fn release(&self, backend: Option<u16>, frontend: Option<u16>) {
        if let Some(port) = backend {
            self.backend
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .allocated
                .remove(&port);
        }
        if let Some(port) = frontend {
            self.frontend
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .allocated
                .remove(&port);
        }
    }

    /// Mark ports as in use during startup reconciliation.
    pub fn mark_allocated(&self, backend: Option<u16>, frontend: Option<u16>) {
        if let Some(port) = backend {
            self.backend
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .allocated
                .insert(port);
        }
        if let Some(port) = frontend {
            self.frontend
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .allocated
                .insert(port);
        }
    }

    /// `(backend, frontend)` ports currently held.
    #[must_use]
    pub fn in_use(&self) -> (usize, usize) {
        (
            self.backend
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .allocated
                .len(),
            self.frontend
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .allocated
                .len(),
        )
    }
}
