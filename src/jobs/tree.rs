//! Nested view of a job and its descendants.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::jobs::model::JobRecord;

#[derive(Debug, Clone, Serialize)]
pub struct JobTree {
    #[serde(flatten)]
    pub record: JobRecord,
    pub children: Vec<JobTree>,
}

impl JobTree {
    /// Assemble a tree from `root` and its descendants in any order.
    /// Records whose parent is not in the set are dropped.
    pub fn build(root: JobRecord, descendants: Vec<JobRecord>) -> Self {
        let mut by_parent: HashMap<Uuid, Vec<JobRecord>> = HashMap::new();
        for record in descendants {
            if let Some(parent) = record.job.parent_id {
                by_parent.entry(parent).or_default().push(record);
            }
        }
        Self::attach(root, &mut by_parent)
    }

    fn attach(record: JobRecord, by_parent: &mut HashMap<Uuid, Vec<JobRecord>>) -> Self {
        let mut children = by_parent.remove(&record.id()).unwrap_or_default();
        children.sort_by_key(|c| c.job.created_at);
        let children = children
            .into_iter()
            .map(|child| Self::attach(child, by_parent))
            .collect();
        Self { record, children }
    }

    /// Number of jobs in the tree, root included.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(Self::size).sum::<usize>()
    }

    pub fn find(&self, id: Uuid) -> Option<&JobTree> {
        if self.record.id() == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::config::JobConfig;
    use crate::jobs::model::{Job, JobState, child_id};

    fn record(job: Job) -> JobRecord {
        let state = JobState::new(job.id);
        JobRecord { job, state }
    }

    #[test]
    fn nests_descendants_under_their_parents() {
        let root = Job::root("run", JobConfig::Planning { round: 0 });
        let step = Job::child_of(&root, child_id(root.id, "s"), "s", JobConfig::Planning { round: 0 });
        let a = Job::child_of(&step, child_id(step.id, "a"), "a", JobConfig::Review { round: 0 });
        let b = Job::child_of(&step, child_id(step.id, "b"), "b", JobConfig::Review { round: 0 });
        let stray = Job::child_of(&a, child_id(Uuid::new_v4(), "x"), "x", JobConfig::Review { round: 0 });
        let mut stray = record(stray);
        stray.job.parent_id = Some(Uuid::new_v4());

        let tree = JobTree::build(
            record(root.clone()),
            vec![record(b.clone()), record(step.clone()), record(a.clone()), stray],
        );

        assert_eq!(tree.size(), 4);
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].children.len(), 2);
        assert!(tree.find(b.id).is_some());
        assert_eq!(tree.find(step.id).map(|t| t.children.len()), Some(2));
    }
}
