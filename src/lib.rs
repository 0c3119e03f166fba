pub mod agent;
pub mod agent_loop;
pub mod approval;
pub mod compaction;
pub mod config;
pub mod context;
pub mod error;
pub mod loop_guard;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod sub_agent;
pub mod timeline;
pub mod tools;
pub mod types;

pub use agent::{Agent, Toolset};
pub use agent_loop::{AgentLoop, FinishReason, RunSummary, StepOutcome};
pub use approval::{Approval, ApprovalRelay, ApprovalRequest, ApprovalResponse, SessionId};
pub use compaction::{CompactionStrategy, Compactor, SummarizeCompaction, TruncateCompaction};
pub use config::{LoopControl, ModelConfig};
pub use context::ContextStore;
pub use error::{ConfigError, RunError};
pub use loop_guard::{LoopGuard, LoopGuardConfig};
pub use provider::Llm;
pub use registry::{CapabilityRegistry, Dependency, DependencyKind, ToolFactory, ToolRegistry};
pub use retry::RetryConfig;
pub use sub_agent::SubAgentTool;
pub use timeline::{PendingCorrection, SendCorrectionTool, TimelineController};
pub use types::*;
