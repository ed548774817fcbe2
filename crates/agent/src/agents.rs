use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use exportdesk_core::domain::agent::AgentTask;

/// Black-box worker behind a target agent name (matchmaker, negotiator, pricing, logistics).
///
/// The returned value becomes the task result; an error fails the task with its message.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, task: &AgentTask) -> Result<Value>;
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn register<A>(&mut self, agent: A)
    where
        A: Agent + 'static,
    {
        self.agents.insert(agent.name().to_string(), Arc::new(agent));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use exportdesk_core::domain::agent::AgentTask;
    use exportdesk_core::tasks::TaskEngine;

    use super::{Agent, AgentRegistry};

    struct Echo(&'static str);

    #[async_trait]
    impl Agent for Echo {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, task: &AgentTask) -> Result<Value> {
            Ok(json!({ "echo": task.payload }))
        }
    }

    #[tokio::test]
    async fn registry_resolves_agents_by_name() {
        let mut registry = AgentRegistry::default();
        assert!(registry.is_empty());

        registry.register(Echo("pricing"));
        registry.register(Echo("matchmaker"));
        registry.register(Echo("pricing"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["matchmaker", "pricing"]);
        assert!(registry.get("negotiator").is_none());

        let task = TaskEngine::new().create_task("pricing", json!({ "listing_id": "L-1" }), None, None);
        let agent = registry.get("pricing").expect("registered");
        let result = agent.execute(&task).await.expect("execute");
        assert_eq!(result["echo"]["listing_id"], "L-1");
    }
}
