//! Reference and pid generation

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::term::{Pid, Ref};

/// Generates process-unique references and local pids
///
/// References are strictly increasing for the lifetime of the generator, so
/// their hash keys never repeat.
#[derive(Debug)]
pub struct RefGenerator {
    node: String,
    creation: u32,
    next_ref: AtomicU64,
    next_pid: AtomicU32,
}

impl RefGenerator {
    pub fn new(node: impl Into<String>) -> Self {
        // Creation only has to differ between restarts of the same node name
        let creation = rand::random::<u32>().max(1);
        Self::with_creation(node, creation)
    }

    pub fn with_creation(node: impl Into<String>, creation: u32) -> Self {
        Self {
            node: node.into(),
            creation,
            next_ref: AtomicU64::new(1),
            next_pid: AtomicU32::new(1),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn creation(&self) -> u32 {
        self.creation
    }

    pub fn next_ref(&self) -> Ref {
        let n = self.next_ref.fetch_add(1, Ordering::Relaxed);
        Ref {
            node: self.node.clone(),
            creation: self.creation,
            ids: [
                (n & 0x3ffff) as u32,
                ((n >> 18) & 0xffff_ffff) as u32,
                (n >> 50) as u32,
            ],
        }
    }

    /// A fresh pid for a local connection endpoint
    pub fn next_pid(&self) -> Pid {
        let id = self.next_pid.fetch_add(1, Ordering::Relaxed);
        Pid::new(self.node.clone(), id, 0, self.creation)
    }
}
