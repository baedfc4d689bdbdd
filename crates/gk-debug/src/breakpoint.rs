//! Breakpoint management for debugging

use std::collections::HashMap;

/// A single execution breakpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Unique breakpoint ID
    pub id: u32,
    /// Effective address of the instruction
    pub address: u32,
    /// Whether the breakpoint is enabled
    pub enabled: bool,
    /// Number of times the breakpoint stopped execution
    pub hit_count: u64,
    /// Optional description/label
    pub label: Option<String>,
}

impl Breakpoint {
    /// Create a new execution breakpoint
    pub fn new(id: u32, address: u32) -> Self {
        Self {
            id,
            address,
            enabled: true,
            hit_count: 0,
            label: None,
        }
    }

    /// Set the breakpoint label
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Record a hit on this breakpoint
    pub fn record_hit(&mut self) {
        self.hit_count += 1;
    }
}

/// Breakpoint manager
///
/// Translated blocks end before any enabled breakpoint address, so every
/// change to the enabled set raises a flag the run-loop consumes to drop
/// stale blocks.
#[derive(Debug, Default)]
pub struct BreakpointManager {
    /// All breakpoints indexed by ID
    breakpoints: HashMap<u32, Breakpoint>,
    /// Breakpoint ID by address
    by_address: HashMap<u32, u32>,
    /// Sorted addresses of enabled breakpoints
    enabled: Vec<u32>,
    next_id: u32,
    changed: bool,
}

impl BreakpointManager {
    /// Create a new breakpoint manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an execution breakpoint; an existing one at the same address is
    /// returned instead of a duplicate
    pub fn add(&mut self, address: u32) -> u32 {
        if let Some(&id) = self.by_address.get(&address) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;

        self.breakpoints.insert(id, Breakpoint::new(id, address));
        self.by_address.insert(address, id);
        self.rebuild();

        tracing::debug!("Added breakpoint {} at 0x{:08X}", id, address);
        id
    }

    /// Add a labelled breakpoint
    pub fn add_labelled(&mut self, address: u32, label: &str) -> u32 {
        let id = self.add(address);
        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.label = Some(label.to_string());
        }
        id
    }

    /// Remove a breakpoint by ID
    pub fn remove(&mut self, id: u32) -> Option<Breakpoint> {
        let bp = self.breakpoints.remove(&id)?;
        self.by_address.remove(&bp.address);
        self.rebuild();
        tracing::debug!("Removed breakpoint {} at 0x{:08X}", id, bp.address);
        Some(bp)
    }

    /// Remove the breakpoint at an address
    pub fn remove_at(&mut self, address: u32) -> Option<Breakpoint> {
        let id = *self.by_address.get(&address)?;
        self.remove(id)
    }

    /// Enable a breakpoint
    pub fn enable(&mut self, id: u32) -> bool {
        self.set_enabled(id, true)
    }

    /// Disable a breakpoint
    pub fn disable(&mut self, id: u32) -> bool {
        self.set_enabled(id, false)
    }

    fn set_enabled(&mut self, id: u32, enabled: bool) -> bool {
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return false;
        };
        if bp.enabled != enabled {
            bp.enabled = enabled;
            self.rebuild();
        }
        true
    }

    fn rebuild(&mut self) {
        let mut enabled: Vec<u32> = self
            .breakpoints
            .values()
            .filter(|bp| bp.enabled)
            .map(|bp| bp.address)
            .collect();
        enabled.sort_unstable();
        if enabled != self.enabled {
            self.enabled = enabled;
            self.changed = true;
        }
    }

    /// Check for an enabled breakpoint at `address`, counting the hit
    pub fn check(&mut self, address: u32) -> Option<&Breakpoint> {
        if self.enabled.binary_search(&address).is_err() {
            return None;
        }
        let id = *self.by_address.get(&address)?;
        let bp = self.breakpoints.get_mut(&id)?;
        bp.record_hit();
        Some(bp)
    }

    /// Whether an enabled breakpoint exists at `address` (no hit recorded)
    pub fn contains(&self, address: u32) -> bool {
        self.enabled.binary_search(&address).is_ok()
    }

    /// Sorted addresses of the enabled breakpoints
    pub fn addresses(&self) -> &[u32] {
        &self.enabled
    }

    /// Returns and clears the "enabled set changed" flag
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// Get all breakpoints, ordered by address
    pub fn get_all(&self) -> Vec<&Breakpoint> {
        let mut all: Vec<&Breakpoint> = self.breakpoints.values().collect();
        all.sort_by_key(|bp| bp.address);
        all
    }

    /// Get a breakpoint by ID
    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// Get the total number of breakpoints
    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }

    /// Clear all breakpoints
    pub fn clear(&mut self) {
        self.breakpoints.clear();
        self.by_address.clear();
        self.rebuild();
        tracing::debug!("Cleared all breakpoints");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_creation() {
        let bp = Breakpoint::new(0, 0x8000_3100).with_label("main");
        assert_eq!(bp.address, 0x8000_3100);
        assert!(bp.enabled);
        assert_eq!(bp.hit_count, 0);
        assert_eq!(bp.label.as_deref(), Some("main"));
    }

    #[test]
    fn test_breakpoint_manager_add_remove() {
        let mut mgr = BreakpointManager::new();

        let id1 = mgr.add(0x8000_3104);
        let id2 = mgr.add(0x8000_3100);
        assert_eq!(mgr.add(0x8000_3100), id2);
        assert_eq!(mgr.count(), 2);
        assert_eq!(mgr.addresses(), &[0x8000_3100, 0x8000_3104]);

        mgr.remove(id1);
        assert_eq!(mgr.count(), 1);
        assert!(mgr.get(id1).is_none());
        assert!(mgr.remove_at(0x8000_3100).is_some());
        assert!(mgr.addresses().is_empty());
    }

    #[test]
    fn test_breakpoint_check_counts_hits() {
        let mut mgr = BreakpointManager::new();
        let id = mgr.add(0x8000_3100);

        assert!(mgr.check(0x8000_3100).is_some());
        assert!(mgr.check(0x8000_3104).is_none());
        assert!(mgr.check(0x8000_3100).is_some());
        assert_eq!(mgr.get(id).map(|bp| bp.hit_count), Some(2));
    }

    #[test]
    fn test_breakpoint_enable_disable() {
        let mut mgr = BreakpointManager::new();
        let id = mgr.add(0x8000_3100);
        assert!(mgr.take_changed());
        assert!(!mgr.take_changed());

        mgr.disable(id);
        assert!(mgr.take_changed());
        assert!(mgr.check(0x8000_3100).is_none());
        assert!(!mgr.contains(0x8000_3100));

        // Disabling twice leaves the set untouched
        mgr.disable(id);
        assert!(!mgr.take_changed());

        mgr.enable(id);
        assert!(mgr.take_changed());
        assert!(mgr.check(0x8000_3100).is_some());
        assert!(!mgr.enable(99));
    }
}
