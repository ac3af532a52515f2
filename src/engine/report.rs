// src/engine/report.rs

use std::collections::BTreeMap;
use std::fmt;

use crate::types::{EngineState, SlotState};

/// Diagnostic snapshot of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub state: EngineState,
    pub slots: BTreeMap<String, SlotReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReport {
    pub state: SlotState,
    /// Number of successful starts so far.
    pub generation: u64,
    pub inputs: Vec<String>,
    pub failures: u32,
    pub last_error: Option<String>,
}

impl Report {
    pub fn slot(&self, name: &str) -> Option<&SlotReport> {
        self.slots.get(name)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "engine: {}", self.state)?;
        for (name, slot) in &self.slots {
            write!(
                f,
                "  {name}: {} (generation {}, failures {})",
                slot.state, slot.generation, slot.failures
            )?;
            if let Some(err) = &slot.last_error {
                write!(f, " last error: {err}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
