//! Task Management
//!
//! Based on Mach4 kern/task.h/c by Avadis Tevanian, Jr.
//!
//! A task owns an address space (page directory plus region map), a set of
//! threads and a position in the parent/child tree. Exited children stay
//! behind as zombies holding only their id and exit status until the
//! parent collects them with `wait`.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::queue::{Chained, QueueChain, QueueHead};
use crate::types::{PhysAddr, TaskId, Tid};
use crate::vm::MapList;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Alive,
    /// Last thread vanished; waiting to be collected
    Zombie,
}

/// Task control block
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    /// `None` only for the idle and init tasks
    pub parent: Option<TaskId>,
    pub page_dir: PhysAddr,
    pub maps: MapList,
    pub exit_status: i32,
    pub state: TaskState,
    /// Threads and page directory already returned
    pub reclaimed: bool,
    pub live_threads: QueueHead<Tid>,
    pub zombie_threads: QueueHead<Tid>,
    pub children: QueueHead<TaskId>,
    pub zombie_children: QueueHead<TaskId>,
    /// Threads of this task blocked in `wait`
    pub waiters: QueueHead<Tid>,
    pub(crate) sibling_link: QueueChain<TaskId>,
}

impl Task {
    pub fn new(id: TaskId, parent: Option<TaskId>, page_dir: PhysAddr, maps: MapList) -> Self {
        Self {
            id,
            parent,
            page_dir,
            maps,
            exit_status: 0,
            state: TaskState::Alive,
            reclaimed: false,
            live_threads: QueueHead::new(),
            zombie_threads: QueueHead::new(),
            children: QueueHead::new(),
            zombie_children: QueueHead::new(),
            waiters: QueueHead::new(),
            sibling_link: QueueChain::new(),
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state == TaskState::Zombie
    }
}

/// Which of a task's child lists to operate on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildList {
    Live,
    Zombie,
}

/// All task control blocks, keyed by id
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: BTreeMap<TaskId, Task>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: Task) {
        self.tasks.insert(task.id, task);
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        self.tasks.remove(&id)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Lookup for an id the caller knows is present
    pub fn task(&self, id: TaskId) -> &Task {
        match self.tasks.get(&id) {
            Some(t) => t,
            None => panic!("no control block for {}", id),
        }
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        match self.tasks.get_mut(&id) {
            Some(t) => t,
            None => panic!("no control block for {}", id),
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run `f` on one of `owner`'s child lists
    ///
    /// The list head lives inside a record of this same table, so it is
    /// copied out, updated against the table, and written back.
    pub fn with_children<R>(
        &mut self,
        owner: TaskId,
        which: ChildList,
        f: impl FnOnce(&mut QueueHead<TaskId>, &mut SiblingLinks<'_>) -> R,
    ) -> R {
        let mut head = match which {
            ChildList::Live => self.task(owner).children,
            ChildList::Zombie => self.task(owner).zombie_children,
        };
        let result = f(&mut head, &mut SiblingLinks(self));
        let task = self.task_mut(owner);
        match which {
            ChildList::Live => task.children = head,
            ChildList::Zombie => task.zombie_children = head,
        }
        result
    }

    /// Ids in one of `owner`'s child lists, in order
    pub fn child_ids(&self, owner: TaskId, which: ChildList) -> Vec<TaskId> {
        let task = self.task(owner);
        let head = match which {
            ChildList::Live => task.children,
            ChildList::Zombie => task.zombie_children,
        };
        head.iter(&SiblingView(self)).collect()
    }
}

/// Mutable view over the sibling chains of a task table
pub struct SiblingLinks<'a>(pub &'a mut TaskTable);

impl Chained<TaskId> for SiblingLinks<'_> {
    fn chain(&self, id: TaskId) -> Option<&QueueChain<TaskId>> {
        self.0.tasks.get(&id).map(|t| &t.sibling_link)
    }

    fn chain_mut(&mut self, id: TaskId) -> Option<&mut QueueChain<TaskId>> {
        self.0.tasks.get_mut(&id).map(|t| &mut t.sibling_link)
    }
}

/// Read-only view for walking sibling chains
struct SiblingView<'a>(&'a TaskTable);

impl Chained<TaskId> for SiblingView<'_> {
    fn chain(&self, id: TaskId) -> Option<&QueueChain<TaskId>> {
        self.0.tasks.get(&id).map(|t| &t.sibling_link)
    }

    fn chain_mut(&mut self, _id: TaskId) -> Option<&mut QueueChain<TaskId>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(ids: &[u32]) -> TaskTable {
        let mut table = TaskTable::new();
        for &id in ids {
            table.insert(Task::new(TaskId(id), None, 0, MapList::new()));
        }
        table
    }

    #[test]
    fn test_child_lists() {
        let mut table = table_with(&[1, 2, 3]);
        for c in [2, 3] {
            table.with_children(TaskId(1), ChildList::Live, |q, links| {
                q.push_back(links, TaskId(c))
            });
        }
        assert_eq!(table.child_ids(TaskId(1), ChildList::Live), [TaskId(2), TaskId(3)]);

        // move 2 from live to zombie
        table.with_children(TaskId(1), ChildList::Live, |q, links| q.remove(links, TaskId(2)));
        table.with_children(TaskId(1), ChildList::Zombie, |q, links| {
            q.push_back(links, TaskId(2))
        });
        assert_eq!(table.child_ids(TaskId(1), ChildList::Live), [TaskId(3)]);
        assert_eq!(table.child_ids(TaskId(1), ChildList::Zombie), [TaskId(2)]);
        assert_eq!(table.task(TaskId(1)).children.len(), 1);
    }

    #[test]
    fn test_remove_task() {
        let mut table = table_with(&[7]);
        assert!(table.contains(TaskId(7)));
        let t = table.remove(TaskId(7)).unwrap();
        assert_eq!(t.state, TaskState::Alive);
        assert!(table.is_empty());
    }
}
