//! Tool construction from declared dependencies.
//!
//! Tools declare the collaborators they need as [`DependencyKind`]s. A
//! [`CapabilityRegistry`] holds the concrete instances. Building a toolset
//! checks every declaration up front and reports all unresolved
//! dependencies at once instead of failing on the first tool.

use crate::agent::Toolset;
use crate::approval::Approval;
use crate::provider::Llm;
use crate::timeline::TimelineController;
use crate::types::*;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    Approval,
    Timeline,
    Outbound,
    Llm,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approval => write!(f, "approval"),
            Self::Timeline => write!(f, "timeline"),
            Self::Outbound => write!(f, "outbound"),
            Self::Llm => write!(f, "llm"),
        }
    }
}

#[derive(Clone)]
pub enum Dependency {
    Approval(Approval),
    Timeline(TimelineController),
    Outbound(mpsc::UnboundedSender<AgentEvent>),
    Llm(Llm),
}

impl Dependency {
    pub fn kind(&self) -> DependencyKind {
        match self {
            Self::Approval(_) => DependencyKind::Approval,
            Self::Timeline(_) => DependencyKind::Timeline,
            Self::Outbound(_) => DependencyKind::Outbound,
            Self::Llm(_) => DependencyKind::Llm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedDependency {
    pub tool: String,
    pub kind: DependencyKind,
}

impl fmt::Display for UnresolvedDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} needs {}", self.tool, self.kind)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unresolved tool dependencies: {}", format_unresolved(.0))]
    Unresolved(Vec<UnresolvedDependency>),
    #[error("tool '{0}' is registered more than once")]
    DuplicateTool(String),
}

fn format_unresolved(missing: &[UnresolvedDependency]) -> String {
    missing
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Concrete collaborators available to tool factories, one per kind.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    deps: HashMap<DependencyKind, Dependency>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependency, replacing any previous one of the same kind.
    pub fn provide(mut self, dependency: Dependency) -> Self {
        self.deps.insert(dependency.kind(), dependency);
        self
    }

    pub fn contains(&self, kind: DependencyKind) -> bool {
        self.deps.contains_key(&kind)
    }

    pub fn approval(&self) -> Option<&Approval> {
        match self.deps.get(&DependencyKind::Approval) {
            Some(Dependency::Approval(a)) => Some(a),
            _ => None,
        }
    }

    pub fn timeline(&self) -> Option<&TimelineController> {
        match self.deps.get(&DependencyKind::Timeline) {
            Some(Dependency::Timeline(t)) => Some(t),
            _ => None,
        }
    }

    pub fn outbound(&self) -> Option<&mpsc::UnboundedSender<AgentEvent>> {
        match self.deps.get(&DependencyKind::Outbound) {
            Some(Dependency::Outbound(tx)) => Some(tx),
            _ => None,
        }
    }

    pub fn llm(&self) -> Option<&Llm> {
        match self.deps.get(&DependencyKind::Llm) {
            Some(Dependency::Llm(llm)) => Some(llm),
            _ => None,
        }
    }

    /// Fetch a dependency a factory declared. Only fails if the factory
    /// reads something it did not declare.
    pub fn require<'a, T>(
        &'a self,
        tool: &str,
        kind: DependencyKind,
        get: impl FnOnce(&'a Self) -> Option<T>,
    ) -> Result<T, RegistryError> {
        get(self).ok_or_else(|| {
            RegistryError::Unresolved(vec![UnresolvedDependency {
                tool: tool.to_string(),
                kind,
            }])
        })
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.deps.keys()).finish()
    }
}

type BuildFn =
    Box<dyn Fn(&CapabilityRegistry) -> Result<Box<dyn AgentTool>, RegistryError> + Send + Sync>;

/// Declares a tool's name and needs, and how to build it.
pub struct ToolFactory {
    pub name: String,
    pub requires: Vec<DependencyKind>,
    build: BuildFn,
}

impl ToolFactory {
    pub fn new<F>(name: impl Into<String>, requires: Vec<DependencyKind>, build: F) -> Self
    where
        F: Fn(&CapabilityRegistry) -> Result<Box<dyn AgentTool>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            requires,
            build: Box::new(build),
        }
    }

    fn missing(&self, registry: &CapabilityRegistry) -> Vec<UnresolvedDependency> {
        self.requires
            .iter()
            .filter(|kind| !registry.contains(**kind))
            .map(|kind| UnresolvedDependency {
                tool: self.name.clone(),
                kind: *kind,
            })
            .collect()
    }
}

impl fmt::Debug for ToolFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolFactory")
            .field("name", &self.name)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

/// Named tool factories, in registration order.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    factories: Vec<ToolFactory>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: ToolFactory) -> Result<(), RegistryError> {
        if self.factories.iter().any(|f| f.name == factory.name) {
            return Err(RegistryError::DuplicateTool(factory.name));
        }
        self.factories.push(factory);
        Ok(())
    }

    pub fn with(mut self, factory: ToolFactory) -> Result<Self, RegistryError> {
        self.register(factory)?;
        Ok(self)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(|f| f.name.as_str()).collect()
    }

    /// Build every registered tool not in `exclude` (matched case-insensitively).
    ///
    /// All factories are validated before any is built; the error lists
    /// every missing dependency across all of them.
    pub fn build_toolset(
        &self,
        registry: &CapabilityRegistry,
        exclude: &[&str],
    ) -> Result<Toolset, RegistryError> {
        let excluded: HashSet<String> = exclude.iter().map(|n| n.to_lowercase()).collect();
        let selected: Vec<&ToolFactory> = self
            .factories
            .iter()
            .filter(|f| !excluded.contains(&f.name.to_lowercase()))
            .collect();

        let missing: Vec<UnresolvedDependency> =
            selected.iter().flat_map(|f| f.missing(registry)).collect();
        if !missing.is_empty() {
            return Err(RegistryError::Unresolved(missing));
        }

        let mut toolset = Toolset::new();
        for factory in selected {
            let tool = (factory.build)(registry)?;
            if toolset.contains(tool.name()) {
                return Err(RegistryError::DuplicateTool(tool.name().to_string()));
            }
            debug!(tool = %factory.name, "built tool");
            toolset.add(tool);
        }
        Ok(toolset)
    }
}
