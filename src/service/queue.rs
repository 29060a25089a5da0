//! Priority request queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::oneshot;

use crate::pipeline::{ExecuteOptions, PipelineContext, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// A request accepted by the service
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: String,
    pub request: String,
    pub context: PipelineContext,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub options: ExecuteOptions,
}

/// A request waiting for a slot, plus whoever is waiting for its result
pub(crate) struct QueuedRequest {
    pub request: ExecutionRequest,
    pub waiter: Option<oneshot::Sender<PipelineResult>>,
}

/// FIFO within a priority tier, higher tiers first
#[derive(Default)]
pub(crate) struct RequestQueue {
    items: VecDeque<QueuedRequest>,
}

impl RequestQueue {
    /// Insert before the first entry with a lower priority
    pub fn insert(&mut self, item: QueuedRequest) {
        let priority = item.request.priority;
        match self
            .items
            .iter()
            .position(|queued| queued.request.priority < priority)
        {
            Some(index) => self.items.insert(index, item),
            None => self.items.push_back(item),
        }
    }

    pub fn pop(&mut self) -> Option<QueuedRequest> {
        self.items.pop_front()
    }

    pub fn remove(&mut self, id: &str) -> Option<QueuedRequest> {
        let index = self.items.iter().position(|q| q.request.id == id)?;
        self.items.remove(index)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|q| q.request.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        self.items.drain(..).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|q| q.request.id.clone()).collect()
    }
}
