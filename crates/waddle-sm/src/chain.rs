//! Sequential composition of inline feature steps.
//!
//! Used where one request enables several features at once (Bind2 inline
//! `<enable/>` elements). Steps run in order; a step returning
//! [`StepOutcome::Stop`] or an error ends the chain.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;
use tracing::trace;

use crate::error::SmError;
use crate::session::ResourceConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Stop,
}

/// One inline step.
#[async_trait]
pub trait InlineStep: Send + Sync {
    fn id(&self) -> &str;

    /// Handle the request, appending any payload for the response.
    async fn run(
        &self,
        session: &Arc<ResourceConnection>,
        request: &Element,
        response: &mut Vec<Element>,
    ) -> Result<StepOutcome, SmError>;
}

#[derive(Clone, Default)]
pub struct InlineChain {
    steps: Vec<Arc<dyn InlineStep>>,
}

impl InlineChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, step: Arc<dyn InlineStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step until one stops or fails. Returns the last outcome.
    pub async fn run(
        &self,
        session: &Arc<ResourceConnection>,
        request: &Element,
        response: &mut Vec<Element>,
    ) -> Result<StepOutcome, SmError> {
        for step in &self.steps {
            trace!(step = step.id(), "Running inline step");
            if step.run(session, request, response).await? == StepOutcome::Stop {
                trace!(step = step.id(), "Inline chain stopped");
                return Ok(StepOutcome::Stop);
            }
        }
        Ok(StepOutcome::Continue)
    }
}

impl fmt::Debug for InlineChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|s| s.id().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jid::Jid;

    struct Step {
        name: &'static str,
        outcome: Result<StepOutcome, ()>,
    }

    #[async_trait]
    impl InlineStep for Step {
        fn id(&self) -> &str {
            self.name
        }

        async fn run(
            &self,
            _session: &Arc<ResourceConnection>,
            _request: &Element,
            response: &mut Vec<Element>,
        ) -> Result<StepOutcome, SmError> {
            response.push(Element::builder(self.name, "urn:test").build());
            self.outcome.map_err(|_| SmError::internal(self.name))
        }
    }

    fn step(name: &'static str, outcome: Result<StepOutcome, ()>) -> Arc<dyn InlineStep> {
        Arc::new(Step { name, outcome })
    }

    fn session() -> Arc<ResourceConnection> {
        Arc::new(ResourceConnection::new(
            Jid::new("c2s@example.com/conn-1").unwrap(),
            "example.com",
        ))
    }

    fn request() -> Element {
        Element::builder("bind", "urn:xmpp:bind:0").build()
    }

    #[tokio::test]
    async fn test_runs_all_steps() {
        let chain = InlineChain::new()
            .then(step("a", Ok(StepOutcome::Continue)))
            .then(step("b", Ok(StepOutcome::Continue)));
        let mut response = Vec::new();
        let outcome = chain.run(&session(), &request(), &mut response).await.unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
        assert_eq!(response.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_short_circuits() {
        let chain = InlineChain::new()
            .then(step("a", Ok(StepOutcome::Stop)))
            .then(step("b", Ok(StepOutcome::Continue)));
        let mut response = Vec::new();
        let outcome = chain.run(&session(), &request(), &mut response).await.unwrap();
        assert_eq!(outcome, StepOutcome::Stop);
        assert_eq!(response.len(), 1);
    }

    #[tokio::test]
    async fn test_error_short_circuits() {
        let chain = InlineChain::new()
            .then(step("a", Err(())))
            .then(step("b", Ok(StepOutcome::Continue)));
        let mut response = Vec::new();
        assert!(chain.run(&session(), &request(), &mut response).await.is_err());
        assert_eq!(response.len(), 1);
    }
}
