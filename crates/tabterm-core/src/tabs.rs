//! Ordered tab registry, partitioned by group.

use std::collections::HashMap;
use tabterm_types::{Tab, TabGroup, TabStatus};
use uuid::Uuid;

/// Result of removing a tab.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedTab {
    pub tab: Tab,
    /// Tab that became active in the group because the removed one was active.
    pub promoted: Option<Uuid>,
}

/// All open tabs in display order, with one active tab per group.
///
/// Pure bookkeeping: no I/O, no processes. The session manager drives the
/// side effects of each operation.
#[derive(Debug, Default)]
pub struct TabRegistry {
    tabs: Vec<Tab>,
    active: HashMap<TabGroup, Uuid>,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tab. Never activates it.
    pub fn insert(&mut self, tab: Tab) {
        self.tabs.push(tab);
    }

    pub fn get(&self, tab_id: Uuid) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == tab_id)
    }

    pub fn contains(&self, tab_id: Uuid) -> bool {
        self.get(tab_id).is_some()
    }

    /// Make a tab the active one of its group. Unknown ids are ignored.
    pub fn set_active(&mut self, tab_id: Uuid) -> Option<TabGroup> {
        let group = self.get(tab_id)?.group.clone();
        self.active.insert(group.clone(), tab_id);
        Some(group)
    }

    pub fn active(&self, group: &TabGroup) -> Option<Uuid> {
        self.active.get(group).copied()
    }

    pub fn is_active(&self, tab_id: Uuid) -> bool {
        self.active.values().any(|id| *id == tab_id)
    }

    /// Remove a tab. When it was active, its nearest neighbour in the same
    /// group (next, else previous) is promoted.
    pub fn remove(&mut self, tab_id: Uuid) -> Option<RemovedTab> {
        let index = self.tabs.iter().position(|t| t.id == tab_id)?;
        let group = self.tabs[index].group.clone();
        let group_index = self.group_positions(&group).iter().position(|&i| i == index);
        let tab = self.tabs.remove(index);

        let mut promoted = None;
        if self.active.get(&group) == Some(&tab_id) {
            self.active.remove(&group);
            let remaining = self.group_positions(&group);
            let neighbour = group_index
                .and_then(|gi| remaining.get(gi).or_else(|| remaining.last()))
                .map(|&i| self.tabs[i].id);
            if let Some(next) = neighbour {
                self.active.insert(group, next);
                promoted = Some(next);
            }
        }

        Some(RemovedTab { tab, promoted })
    }

    /// Move the tab at `from` to `to` within a group. Other groups are
    /// untouched. Out-of-range indices leave everything unchanged.
    pub fn reorder(&mut self, group: &TabGroup, from: usize, to: usize) -> bool {
        let positions = self.group_positions(group);
        if from >= positions.len() || to >= positions.len() {
            return false;
        }

        let mut ordered: Vec<Tab> = positions.iter().map(|&i| self.tabs[i].clone()).collect();
        let moved = ordered.remove(from);
        ordered.insert(to, moved);
        for (slot, tab) in positions.into_iter().zip(ordered) {
            self.tabs[slot] = tab;
        }
        true
    }

    /// Tabs of a group in display order.
    pub fn list(&self, group: &TabGroup) -> Vec<Tab> {
        self.tabs.iter().filter(|t| &t.group == group).cloned().collect()
    }

    /// Every tab, in display order.
    pub fn all(&self) -> &[Tab] {
        &self.tabs
    }

    /// Groups with at least one tab, in order of first appearance.
    pub fn groups(&self) -> Vec<TabGroup> {
        let mut groups: Vec<TabGroup> = Vec::new();
        for tab in &self.tabs {
            if !groups.contains(&tab.group) {
                groups.push(tab.group.clone());
            }
        }
        groups
    }

    pub fn active_tabs(&self) -> Vec<(TabGroup, Uuid)> {
        self.groups()
            .into_iter()
            .filter_map(|g| self.active(&g).map(|id| (g, id)))
            .collect()
    }

    pub fn rename(&mut self, tab_id: Uuid, title: &str) -> bool {
        match self.tabs.iter_mut().find(|t| t.id == tab_id) {
            Some(tab) => {
                tab.title = title.to_string();
                true
            }
            None => false,
        }
    }

    /// Update a tab's status. Returns `true` if it changed.
    pub fn set_status(&mut self, tab_id: Uuid, status: TabStatus) -> bool {
        match self.tabs.iter_mut().find(|t| t.id == tab_id) {
            Some(tab) if tab.status != status => {
                tab.status = status;
                true
            }
            _ => false,
        }
    }

    fn group_positions(&self, group: &TabGroup) -> Vec<usize> {
        self.tabs
            .iter()
            .enumerate()
            .filter(|(_, t)| &t.group == group)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabterm_types::TabSpec;

    fn tab(title: &str, group: TabGroup) -> Tab {
        Tab::from_spec(TabSpec {
            title: title.into(),
            shell: "/bin/bash".into(),
            working_directory: "/tmp".into(),
            closable: true,
            group,
            ..Default::default()
        })
    }

    fn titles(registry: &TabRegistry, group: &TabGroup) -> Vec<String> {
        registry.list(group).into_iter().map(|t| t.title).collect()
    }

    #[test]
    fn test_insert_does_not_activate() {
        let mut registry = TabRegistry::new();
        let t = tab("a", TabGroup::Global);
        let id = t.id;
        registry.insert(t);
        assert!(registry.active(&TabGroup::Global).is_none());
        assert_eq!(registry.set_active(id), Some(TabGroup::Global));
        assert_eq!(registry.active(&TabGroup::Global), Some(id));
    }

    #[test]
    fn test_set_active_unknown_is_noop() {
        let mut registry = TabRegistry::new();
        let t = tab("a", TabGroup::Global);
        let id = t.id;
        registry.insert(t);
        registry.set_active(id);
        assert_eq!(registry.set_active(Uuid::new_v4()), None);
        assert_eq!(registry.active(&TabGroup::Global), Some(id));
    }

    #[test]
    fn test_one_active_per_group() {
        let mut registry = TabRegistry::new();
        let project = TabGroup::Project("p1".into());
        let a = tab("a", TabGroup::Global);
        let b = tab("b", project.clone());
        let c = tab("c", project.clone());
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        registry.insert(a);
        registry.insert(b);
        registry.insert(c);

        registry.set_active(a_id);
        registry.set_active(b_id);
        registry.set_active(c_id);
        assert_eq!(registry.active(&TabGroup::Global), Some(a_id));
        assert_eq!(registry.active(&project), Some(c_id));
        assert!(!registry.is_active(b_id));
        assert_eq!(registry.groups(), vec![TabGroup::Global, project]);
    }

    #[test]
    fn test_remove_active_promotes_neighbour() {
        let mut registry = TabRegistry::new();
        let tabs: Vec<Tab> = ["a", "b", "c"]
            .iter()
            .map(|t| tab(t, TabGroup::Global))
            .collect();
        let ids: Vec<Uuid> = tabs.iter().map(|t| t.id).collect();
        for t in tabs {
            registry.insert(t);
        }

        registry.set_active(ids[1]);
        let removed = registry.remove(ids[1]).unwrap();
        assert_eq!(removed.promoted, Some(ids[2]));
        assert_eq!(registry.active(&TabGroup::Global), Some(ids[2]));

        // Last in the group: falls back to the previous tab
        let removed = registry.remove(ids[2]).unwrap();
        assert_eq!(removed.promoted, Some(ids[0]));

        let removed = registry.remove(ids[0]).unwrap();
        assert_eq!(removed.promoted, None);
        assert!(registry.active(&TabGroup::Global).is_none());
        assert!(registry.remove(ids[0]).is_none());
    }

    #[test]
    fn test_remove_inactive_keeps_active() {
        let mut registry = TabRegistry::new();
        let a = tab("a", TabGroup::Global);
        let b = tab("b", TabGroup::Global);
        let (a_id, b_id) = (a.id, b.id);
        registry.insert(a);
        registry.insert(b);
        registry.set_active(a_id);

        let removed = registry.remove(b_id).unwrap();
        assert_eq!(removed.promoted, None);
        assert_eq!(registry.active(&TabGroup::Global), Some(a_id));
    }

    #[test]
    fn test_reorder_within_group() {
        let mut registry = TabRegistry::new();
        let project = TabGroup::Project("p".into());
        registry.insert(tab("a", TabGroup::Global));
        registry.insert(tab("p1", project.clone()));
        registry.insert(tab("b", TabGroup::Global));
        registry.insert(tab("p2", project.clone()));
        let c = tab("c", TabGroup::Global);
        let c_id = c.id;
        registry.insert(c);
        registry.set_active(c_id);

        assert!(registry.reorder(&TabGroup::Global, 2, 0));
        assert_eq!(titles(&registry, &TabGroup::Global), vec!["c", "a", "b"]);
        assert_eq!(titles(&registry, &project), vec!["p1", "p2"]);
        assert_eq!(registry.active(&TabGroup::Global), Some(c_id));

        assert!(!registry.reorder(&TabGroup::Global, 0, 3));
        assert!(!registry.reorder(&project, 5, 0));
        assert_eq!(titles(&registry, &TabGroup::Global), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_rename_and_status() {
        let mut registry = TabRegistry::new();
        let t = tab("a", TabGroup::Global);
        let id = t.id;
        registry.insert(t);

        assert!(registry.rename(id, "build"));
        assert!(!registry.rename(Uuid::new_v4(), "x"));
        assert!(registry.set_status(id, TabStatus::Active));
        assert!(!registry.set_status(id, TabStatus::Active));
        let t = registry.get(id).unwrap();
        assert_eq!(t.title, "build");
        assert_eq!(t.status, TabStatus::Active);
    }
}
