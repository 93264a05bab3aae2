use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entry in the priority scheduler's heap (§4.7). Ordering is
/// `(priority, created_at)`: lower `priority` is more urgent; ties are
/// broken by earlier `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub dependencies: Vec<String>,
}

impl ScheduledTask {
    pub fn new(task_id: String, priority: i32, dependencies: Vec<String>) -> Self {
        Self {
            task_id,
            priority,
            created_at: Utc::now(),
            dependencies,
        }
    }

    fn order_key(&self) -> (i32, DateTime<Utc>) {
        (self.priority, self.created_at)
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}
impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Inverted so a plain `BinaryHeap<ScheduledTask>` pops the most urgent
/// (lowest priority value, earliest `created_at`) entry first.
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.order_key().cmp(&self.order_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn heap_pops_lowest_priority_value_first() {
        let mut heap = BinaryHeap::new();
        heap.push(ScheduledTask::new("low-urgency".into(), 10, vec![]));
        heap.push(ScheduledTask::new("high-urgency".into(), 1, vec![]));
        heap.push(ScheduledTask::new("mid-urgency".into(), 5, vec![]));
        assert_eq!(heap.pop().unwrap().task_id, "high-urgency");
        assert_eq!(heap.pop().unwrap().task_id, "mid-urgency");
        assert_eq!(heap.pop().unwrap().task_id, "low-urgency");
    }

    #[test]
    fn ties_broken_by_created_at() {
        let mut first = ScheduledTask::new("first".into(), 1, vec![]);
        let mut second = ScheduledTask::new("second".into(), 1, vec![]);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        second.created_at = Utc::now();
        let mut heap = BinaryHeap::new();
        heap.push(second);
        heap.push(first);
        assert_eq!(heap.pop().unwrap().task_id, "first");
    }
}
