use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

use crate::models::{TaskPriority, TaskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
  pub id: Uuid,
  pub priority: TaskPriority,
  pub task_type: TaskType,
}

/// Tasks waiting for a worker, highest priority first, FIFO within a
/// priority. Holds references only; the registry owns the tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
  tasks: VecDeque<QueuedTask>,
}

impl TaskQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts before the first task of strictly lower priority.
  pub fn push(&mut self, task: QueuedTask) {
    let position = self
      .tasks
      .iter()
      .position(|queued| queued.priority < task.priority)
      .unwrap_or(self.tasks.len());
    self.tasks.insert(position, task);
  }

  /// Picks the next task for a worker. With an affinity set the first task
  /// of a preferred type wins; otherwise, or when none matches, the head.
  pub fn pop_for(&mut self, affinity: Option<&HashSet<TaskType>>) -> Option<QueuedTask> {
    let position = affinity
      .filter(|types| !types.is_empty())
      .and_then(|types| self.tasks.iter().position(|t| types.contains(&t.task_type)))
      .unwrap_or(0);
    self.tasks.remove(position)
  }

  pub fn remove(&mut self, id: Uuid) -> bool {
    match self.tasks.iter().position(|t| t.id == id) {
      Some(position) => {
        self.tasks.remove(position);
        true
      }
      None => false,
    }
  }

  pub fn contains(&self, id: Uuid) -> bool {
    self.tasks.iter().any(|t| t.id == id)
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  pub fn clear(&mut self) {
    self.tasks.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn task(priority: TaskPriority, task_type: TaskType) -> QueuedTask {
    QueuedTask { id: Uuid::new_v4(), priority, task_type }
  }

  fn drain(queue: &mut TaskQueue) -> Vec<Uuid> {
    std::iter::from_fn(|| queue.pop_for(None)).map(|t| t.id).collect()
  }

  #[test]
  fn higher_priority_goes_first() {
    let mut queue = TaskQueue::new();
    let low = task(TaskPriority::Low, TaskType::CacheCleanup);
    let critical = task(TaskPriority::Critical, TaskType::WithdrawalProcessing);
    let normal = task(TaskPriority::Normal, TaskType::DepositProcessing);
    queue.push(low);
    queue.push(critical);
    queue.push(normal);

    assert_eq!(drain(&mut queue), vec![critical.id, normal.id, low.id]);
  }

  #[test]
  fn equal_priorities_keep_insertion_order() {
    let mut queue = TaskQueue::new();
    let first = task(TaskPriority::High, TaskType::BlockFinalization);
    let second = task(TaskPriority::High, TaskType::BlockFinalization);
    let low = task(TaskPriority::Low, TaskType::CacheCleanup);
    let third = task(TaskPriority::High, TaskType::SignatureVerification);
    for t in [first, low, second, third] {
      queue.push(t);
    }

    assert_eq!(drain(&mut queue), vec![first.id, second.id, third.id, low.id]);
  }

  #[test]
  fn affinity_prefers_matching_type() {
    let mut queue = TaskQueue::new();
    let head = task(TaskPriority::Critical, TaskType::DepositProcessing);
    let preferred = task(TaskPriority::Low, TaskType::SignatureVerification);
    queue.push(head);
    queue.push(preferred);

    let affinity = HashSet::from([TaskType::SignatureVerification]);
    assert_eq!(queue.pop_for(Some(&affinity)).map(|t| t.id), Some(preferred.id));
    assert_eq!(queue.len(), 1);
  }

  #[test]
  fn affinity_falls_back_to_head() {
    let mut queue = TaskQueue::new();
    let other = task(TaskPriority::Normal, TaskType::TransactionVerification);
    queue.push(other);

    let affinity = HashSet::from([TaskType::SignatureVerification]);
    assert_eq!(queue.pop_for(Some(&affinity)).map(|t| t.id), Some(other.id));
    assert!(queue.pop_for(Some(&affinity)).is_none());
  }

  #[test]
  fn remove_takes_task_out() {
    let mut queue = TaskQueue::new();
    let a = task(TaskPriority::Normal, TaskType::CacheCleanup);
    let b = task(TaskPriority::Normal, TaskType::CacheCleanup);
    queue.push(a);
    queue.push(b);

    assert!(queue.remove(a.id));
    assert!(!queue.remove(a.id));
    assert!(!queue.contains(a.id));
    assert_eq!(queue.len(), 1);
  }

  #[test]
  fn clear_empties_the_queue() {
    let mut queue = TaskQueue::new();
    queue.push(task(TaskPriority::High, TaskType::DepositProcessing));
    queue.push(task(TaskPriority::Low, TaskType::CacheCleanup));

    queue.clear();
    assert!(queue.is_empty());
    assert!(queue.pop_for(None).is_none());
  }
}
