//! Daemon-side tool layer
//!
//! Tools the model may invoke mid-pipeline. Tools flagged parallel-safe
//! (idempotent reads) fan out concurrently; the rest run sequentially after
//! every parallel tool has finished, so state-changing tools never race.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::server::llm::ToolCallOut;
use crate::session::{Session, SessionRegistry};

/// Context handed to every tool invocation
pub struct ToolContext {
    pub session: Arc<Session>,
    pub registry: Arc<SessionRegistry>,
    pub started: Instant,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    /// Idempotent tools may run concurrently with each other
    fn parallel_safe(&self) -> bool;

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<String>;
}

/// Result of one tool call, tagged with the call id for the model
pub struct ToolOutcome {
    pub call_id: String,
    pub output: String,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in daemon tools
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CurrentTime));
        registry.register(Arc::new(DaemonStatus));
        registry.register(Arc::new(ResetConversation));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Provider-format tool definitions
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }

    /// Execute one batch of requested calls: parallel-safe tools fan out
    /// together, then the rest run in request order.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCallOut],
        ctx: &ToolContext,
    ) -> Vec<ToolOutcome> {
        let mut parallel = Vec::new();
        let mut sequential = Vec::new();
        for call in calls {
            match self.find(&call.function.name) {
                Some(tool) if tool.parallel_safe() => parallel.push((call, Arc::clone(tool))),
                Some(tool) => sequential.push((call, Arc::clone(tool))),
                None => {
                    warn!(name = %call.function.name, "model requested unknown tool");
                    sequential.push((call, Arc::new(UnknownTool) as Arc<dyn Tool>));
                }
            }
        }

        let mut outcomes = Vec::with_capacity(calls.len());

        let parallel_results = join_all(parallel.into_iter().map(|(call, tool)| async move {
            let output = run_tool(tool.as_ref(), call, ctx).await;
            ToolOutcome {
                call_id: call.id.clone(),
                output,
            }
        }))
        .await;
        outcomes.extend(parallel_results);

        for (call, tool) in sequential {
            let output = run_tool(tool.as_ref(), call, ctx).await;
            outcomes.push(ToolOutcome {
                call_id: call.id.clone(),
                output,
            });
        }
        outcomes
    }
}

async fn run_tool(tool: &dyn Tool, call: &ToolCallOut, ctx: &ToolContext) -> String {
    let args: Value =
        serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
    debug!(tool = tool.name(), "invoking tool");
    match tool.invoke(args, ctx).await {
        Ok(output) => output,
        Err(e) => format!("tool error: {e}"),
    }
}

struct UnknownTool;

#[async_trait]
impl Tool for UnknownTool {
    fn name(&self) -> &str {
        "unknown"
    }
    fn description(&self) -> &str {
        "placeholder for unrecognised tool names"
    }
    fn parallel_safe(&self) -> bool {
        false
    }
    async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
        Ok("unknown tool".to_string())
    }
}

/// Wall-clock time, formatted for speech
pub struct CurrentTime;

#[async_trait]
impl Tool for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }
    fn description(&self) -> &str {
        "Get the current local date and time"
    }
    fn parallel_safe(&self) -> bool {
        true
    }
    async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
        Ok(chrono::Local::now().format("%A %B %e, %H:%M").to_string())
    }
}

/// Daemon introspection: session counts and uptime of the work item
pub struct DaemonStatus;

#[async_trait]
impl Tool for DaemonStatus {
    fn name(&self) -> &str {
        "daemon_status"
    }
    fn description(&self) -> &str {
        "Report daemon session count and pipeline timing"
    }
    fn parallel_safe(&self) -> bool {
        true
    }
    async fn invoke(&self, _args: Value, ctx: &ToolContext) -> Result<String> {
        Ok(format!(
            "sessions: {}, pipeline elapsed: {} ms",
            ctx.registry.len(),
            ctx.started.elapsed().as_millis()
        ))
    }
}

/// Clears the session history; mutates state, so never parallel
pub struct ResetConversation;

#[async_trait]
impl Tool for ResetConversation {
    fn name(&self) -> &str {
        "reset_conversation"
    }
    fn description(&self) -> &str {
        "Forget the conversation so far and start fresh"
    }
    fn parallel_safe(&self) -> bool {
        false
    }
    async fn invoke(&self, _args: Value, ctx: &ToolContext) -> Result<String> {
        ctx.session.clear_history();
        Ok("conversation reset".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::llm::FunctionCall;
    use crate::types::{Role, SessionKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn context() -> ToolContext {
        let registry = SessionRegistry::new(8, Duration::from_secs(1800));
        let session = registry.create(SessionKind::Websocket).unwrap();
        ToolContext {
            session,
            registry,
            started: Instant::now(),
        }
    }

    fn call(name: &str, id: &str) -> ToolCallOut {
        ToolCallOut {
            id: id.to_string(),
            call_type: "function",
            function: FunctionCall {
                name: name.to_string(),
                arguments: "{}".to_string(),
            },
        }
    }

    #[test]
    fn test_definitions_shape() {
        let registry = ToolRegistry::with_builtins();
        let defs = registry.definitions();
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0]["type"], "function");
        assert!(defs.iter().any(|d| d["function"]["name"] == "current_time"));
    }

    #[tokio::test]
    async fn test_execute_batch_order() {
        let registry = ToolRegistry::with_builtins();
        let ctx = context();
        let calls = vec![
            call("reset_conversation", "c1"),
            call("current_time", "c2"),
            call("daemon_status", "c3"),
        ];
        let outcomes = registry.execute_batch(&calls, &ctx).await;
        assert_eq!(outcomes.len(), 3);
        // Parallel-safe tools complete first, sequential last
        assert_eq!(outcomes[0].call_id, "c2");
        assert_eq!(outcomes[1].call_id, "c3");
        assert_eq!(outcomes[2].call_id, "c1");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported() {
        let registry = ToolRegistry::with_builtins();
        let ctx = context();
        let outcomes = registry.execute_batch(&[call("bogus", "c9")], &ctx).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].output, "unknown tool");
    }

    #[tokio::test]
    async fn test_reset_conversation_clears_history() {
        let registry = ToolRegistry::with_builtins();
        let ctx = context();
        ctx.session.append_history(Role::User, "hello");
        assert_eq!(ctx.session.history().len(), 1);

        registry
            .execute_batch(&[call("reset_conversation", "c1")], &ctx)
            .await;
        assert!(ctx.session.history().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_tools_overlap() {
        // Two slow parallel-safe tools must run concurrently
        struct SlowTool {
            name: String,
            concurrent: Arc<AtomicU32>,
            peak: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Tool for SlowTool {
            fn name(&self) -> &str {
                &self.name
            }
            fn description(&self) -> &str {
                "sleeps"
            }
            fn parallel_safe(&self) -> bool {
                true
            }
            async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
                let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok("done".to_string())
            }
        }

        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new();
        for name in ["slow_a", "slow_b"] {
            registry.register(Arc::new(SlowTool {
                name: name.to_string(),
                concurrent: Arc::clone(&concurrent),
                peak: Arc::clone(&peak),
            }));
        }

        let ctx = context();
        let calls = vec![call("slow_a", "a"), call("slow_b", "b")];
        registry.execute_batch(&calls, &ctx).await;
        assert_eq!(peak.load(Ordering::SeqCst), 2, "tools did not overlap");
    }
}
