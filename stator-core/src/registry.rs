//! Registry of state graphs, keyed by entity type

use crate::entity::{EntityType, StateName};
use crate::graph::StateGraph;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// All state graphs known to a process.
///
/// Built once at startup and shared read-only between the runner, the
/// manual trigger and the admin surfaces.
#[derive(Debug, Clone, Default)]
pub struct GraphRegistry {
    graphs: BTreeMap<EntityType, Arc<StateGraph>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph; each entity type may only be registered once
    pub fn register(&mut self, graph: StateGraph) -> Result<()> {
        let entity_type = graph.entity_type().clone();
        if self.graphs.contains_key(&entity_type) {
            return Err(Error::Configuration(format!(
                "entity type '{}' registered twice",
                entity_type
            )));
        }
        self.graphs.insert(entity_type, Arc::new(graph));
        Ok(())
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, graph: StateGraph) -> Result<Self> {
        self.register(graph)?;
        Ok(self)
    }

    pub fn get(&self, entity_type: &EntityType) -> Option<&Arc<StateGraph>> {
        self.graphs.get(entity_type)
    }

    /// Look up a graph, failing if the entity type is unknown
    pub fn require(&self, entity_type: &EntityType) -> Result<&Arc<StateGraph>> {
        self.graphs
            .get(entity_type)
            .ok_or_else(|| Error::UnknownEntityType(entity_type.to_string()))
    }

    pub fn graphs(&self) -> impl Iterator<Item = &Arc<StateGraph>> {
        self.graphs.values()
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.graphs.keys()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    /// Every (entity type, state) pair the scheduler polls
    pub fn schedulable(&self) -> Vec<(EntityType, StateName)> {
        self.graphs
            .values()
            .flat_map(|graph| {
                graph
                    .schedulable_states()
                    .map(|def| (graph.entity_type().clone(), def.name().clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StateDef;
    use crate::handler::{handler_fn, Transition};

    fn graph(entity_type: &str) -> StateGraph {
        StateGraph::builder(entity_type)
            .initial("new")
            .state(
                StateDef::new("new")
                    .transitions_to(["done"])
                    .handler(handler_fn(|_| async { Ok(Transition::to("done")) })),
            )
            .state(StateDef::terminal("done"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = GraphRegistry::new()
            .with(graph("post"))
            .unwrap()
            .with(graph("follow"))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get(&"post".into()).is_some());
        assert!(matches!(
            registry.require(&"emoji".into()),
            Err(Error::UnknownEntityType(t)) if t == "emoji"
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = GraphRegistry::new();
        registry.register(graph("post")).unwrap();
        assert!(matches!(
            registry.register(graph("post")),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_schedulable_pairs() {
        let registry = GraphRegistry::new().with(graph("post")).unwrap();
        assert_eq!(
            registry.schedulable(),
            vec![(EntityType::from("post"), StateName::from("new"))]
        );
    }
}
