use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(#[serde(with = "uuid::serde::compact")] Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse_str(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(TaskId);
id_newtype!(WorkerId);
id_newtype!(EventId);
id_newtype!(SubscriptionId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TextProcessing,
    CodeGeneration,
    DataAnalysis,
    WebScraping,
    ApiCall,
    FileProcessing,
    Computation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Collapses the four task priorities onto the three dispatch lanes C5
    /// actually queues on.
    pub fn lane(self) -> Lane {
        match self {
            Priority::Critical | Priority::High => Lane::High,
            Priority::Normal => Lane::Normal,
            Priority::Low => Lane::Background,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    High,
    Normal,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Paused,
    Retry,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,
    pub parent_id: Option<TaskId>,
    pub dependencies: HashSet<TaskId>,
    pub required_capabilities: HashSet<String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: u32,
    pub retry_count: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub complexity: u32,
    pub preferred_worker: Option<String>,
    pub error: Option<TaskError>,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, task_type: TaskType, input: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            title: title.into(),
            task_type,
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            parent_id: None,
            dependencies: HashSet::new(),
            required_capabilities: HashSet::new(),
            timeout_seconds: None,
            max_retries: 3,
            retry_count: 0,
            deadline: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            progress: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            complexity: 1,
            preferred_worker: None,
            error: None,
            input,
            output: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Paused,
    Error,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_mb: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub worker_type: String,
    pub host: String,
    pub capabilities: HashSet<String>,
    pub max_concurrency: u32,
    pub current_load: u32,
    pub status: WorkerStatus,
    pub speed_multiplier: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub resource_usage: ResourceUsage,
}

impl Worker {
    pub fn new(worker_type: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: WorkerId::new(),
            worker_type: worker_type.into(),
            host: host.into(),
            capabilities: HashSet::new(),
            max_concurrency: 1,
            current_load: 0,
            status: WorkerStatus::Idle,
            speed_multiplier: 1.0,
            last_heartbeat: Utc::now(),
            last_error: None,
            error_count: 0,
            resource_usage: ResourceUsage {
                cpu_percent: 0.0,
                memory_mb: 0.0,
            },
        }
    }

    pub fn load_fraction(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 1.0;
        }
        self.current_load as f64 / self.max_concurrency as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStatus,
    TaskUpdate,
    Metrics,
    SystemAlert,
    Broadcast,
    Heartbeat,
    PerformanceAlert,
    LogMessage,
    Collaboration,
}

impl EventType {
    /// The stable bus channel name each event type routes to; matches §6's
    /// channel table one-to-one.
    pub fn channel(self) -> &'static str {
        match self {
            EventType::AgentStatus => "agents",
            EventType::TaskUpdate => "tasks",
            EventType::Metrics => "metrics",
            EventType::SystemAlert => "alerts",
            EventType::Collaboration => "collaboration",
            EventType::Broadcast => "broadcast",
            EventType::Heartbeat => "heartbeat",
            EventType::PerformanceAlert => "performance",
            EventType::LogMessage => "logs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub data: serde_json::Value,
    pub target_clients: Option<HashSet<SubscriptionId>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(event_type: EventType, priority: Priority, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            priority,
            timestamp: Utc::now(),
            source: source.into(),
            data,
            target_clients: None,
            expires_at: None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.data.get("agent_id").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: &'static str,
    pub buffer_size: usize,
    pub retention_seconds: i64,
    pub compression: bool,
}

/// Stable channel configuration table, matching the capacities in §6 exactly.
pub fn channel_config(event_type: EventType) -> ChannelConfig {
    let (name, buffer_size) = match event_type {
        EventType::AgentStatus => ("agents", 500),
        EventType::TaskUpdate => ("tasks", 1000),
        EventType::Metrics => ("metrics", 200),
        EventType::SystemAlert => ("alerts", 100),
        EventType::Collaboration => ("collaboration", 300),
        EventType::Broadcast => ("broadcast", 50),
        EventType::Heartbeat => ("heartbeat", 10),
        EventType::PerformanceAlert => ("performance", 100),
        EventType::LogMessage => ("logs", 2000),
    };
    ChannelConfig {
        name,
        buffer_size,
        retention_seconds: 3600,
        compression: false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Option<HashSet<EventType>>,
    pub min_priority: Option<Priority>,
    pub agent_ids: Option<HashSet<String>>,
    pub data_equals: HashMap<String, serde_json::Value>,
}

impl EventFilter {
    /// Fixed, short-circuiting evaluation order per §4.6: type allow-list,
    /// priority floor, agent allow-list, then data-field equality map.
    pub fn accepts(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(floor) = self.min_priority {
            if event.priority < floor {
                return false;
            }
        }
        if let Some(agents) = &self.agent_ids {
            if let Some(agent_id) = event.agent_id() {
                if !agents.contains(agent_id) {
                    return false;
                }
            }
        }
        for (field, expected) in &self.data_equals {
            match event.data.get(field) {
                Some(actual) if actual == expected => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub task: Task,
    pub failure_message: String,
    pub attempts: u32,
    pub first_failure_at: DateTime<Utc>,
}
