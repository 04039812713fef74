//! Per-topic task queue.
//!
//! Tasks of the same topic keep their submission order and are batched
//! together. Across topics, the next batch comes from the topic whose head
//! task has the highest priority; equal priorities go to the earliest
//! submission.

use std::collections::{BTreeMap, VecDeque};

use super::task::{Task, TaskListener};

/// A task waiting in the queue together with its listener.
#[derive(Debug)]
pub struct QueuedTask {
    pub seq: u64,
    pub task: Task,
    pub listener: TaskListener,
}

/// Ordered same-topic tasks dequeued together.
#[derive(Debug)]
pub struct TaskBatch {
    pub topic: String,
    pub tasks: Vec<QueuedTask>,
}

impl TaskBatch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Separate the tasks from their listeners, keeping both in order.
    pub fn split(self) -> (Vec<Task>, Vec<(String, TaskListener)>) {
        self.tasks
            .into_iter()
            .map(|q| {
                let source = q.task.source.clone();
                (q.task, (source, q.listener))
            })
            .unzip()
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    topics: BTreeMap<String, VecDeque<QueuedTask>>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. Returns its submission sequence number.
    pub fn push(&mut self, topic: impl Into<String>, task: Task, listener: TaskListener) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.topics
            .entry(topic.into())
            .or_default()
            .push_back(QueuedTask { seq, task, listener });
        seq
    }

    pub fn len(&self) -> usize {
        self.topics.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Take up to `max` tasks from the topic scheduled next.
    pub fn next_batch(&mut self, max: usize) -> Option<TaskBatch> {
        let topic = self
            .topics
            .iter()
            .filter_map(|(topic, tasks)| tasks.front().map(|head| (topic, head)))
            .max_by(|(_, a), (_, b)| {
                a.task
                    .priority
                    .cmp(&b.task.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(topic, _)| topic.clone())?;

        let queue = self.topics.get_mut(&topic)?;
        let take = max.max(1).min(queue.len());
        let tasks: Vec<QueuedTask> = queue.drain(..take).collect();
        if queue.is_empty() {
            self.topics.remove(&topic);
        }
        Some(TaskBatch { topic, tasks })
    }

    /// Remove every pending task, in submission order.
    pub fn drain_all(&mut self) -> Vec<QueuedTask> {
        let mut all: Vec<QueuedTask> = std::mem::take(&mut self.topics)
            .into_values()
            .flatten()
            .collect();
        all.sort_by_key(|q| q.seq);
        all
    }
}
