use serde::Serialize;
use v8_debug_client::BreakpointSpec;

/// A user breakpoint and the protocol number it is bound to right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogicalBreakpoint {
    pub spec: BreakpointSpec,
    pub bound: Option<u32>,
}

/// User breakpoints in the order they were set. Survives script regeneration.
#[derive(Debug, Default)]
pub struct LogicalBreakpoints {
    entries: Vec<LogicalBreakpoint>,
}

impl LogicalBreakpoints {
    pub fn push(&mut self, spec: BreakpointSpec, bound: u32) {
        self.entries.push(LogicalBreakpoint {
            spec,
            bound: Some(bound),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicalBreakpoint> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<LogicalBreakpoint> {
        self.entries.clone()
    }

    pub fn find_bound(&self, number: u32) -> Option<&LogicalBreakpoint> {
        self.entries.iter().find(|entry| entry.bound == Some(number))
    }

    pub fn find_bound_mut(&mut self, number: u32) -> Option<&mut LogicalBreakpoint> {
        self.entries
            .iter_mut()
            .find(|entry| entry.bound == Some(number))
    }

    pub fn remove_bound(&mut self, number: u32) -> Option<BreakpointSpec> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.bound == Some(number))?;
        Some(self.entries.remove(index).spec)
    }

    /// Forgets every protocol number; called before a rebind pass.
    pub fn unbind_all(&mut self) {
        for entry in &mut self.entries {
            entry.bound = None;
        }
    }

    pub fn bind(&mut self, index: usize, number: u32) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.bound = Some(number);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_order_and_tracks_bindings() {
        let mut list = LogicalBreakpoints::default();
        list.push(BreakpointSpec::at_line(5), 1);
        list.push(BreakpointSpec::at_line(9).condition("x > 1"), 2);
        assert_eq!(list.len(), 2);

        list.unbind_all();
        assert!(list.iter().all(|entry| entry.bound.is_none()));
        list.bind(0, 7);
        list.bind(1, 8);
        list.bind(5, 9);

        assert_eq!(list.find_bound(8).map(|entry| entry.spec.line), Some(9));
        assert_eq!(list.remove_bound(7).map(|spec| spec.line), Some(5));
        assert_eq!(list.remove_bound(7), None);
        assert_eq!(list.iter().map(|entry| entry.spec.line).collect::<Vec<_>>(), vec![9]);
    }
}
