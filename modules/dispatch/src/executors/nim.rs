//! Nim: inference-backed decision handlers

use async_trait::async_trait;
use river::EventEnvelope;
use std::sync::Arc;
use std::time::Duration;

use super::contract::ResponseContract;
use super::provider::{InferenceProvider, InferenceRequest};
use super::{Emitter, Executor, ExecutorKind};
use crate::outcome::Outcome;
use crate::template::Template;

/// Decision executor for one binding
pub struct Nim {
    provider: Arc<dyn InferenceProvider>,
    prompt: Template,
    contract: ResponseContract,
    system: Option<String>,
    model: Option<String>,
    reparse_retries: u32,
    timeout: Duration,
    emitter: Emitter,
}

impl Nim {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        prompt: Template,
        contract: ResponseContract,
        timeout: Duration,
        emitter: Emitter,
    ) -> Self {
        Self {
            provider,
            prompt,
            contract,
            system: None,
            model: None,
            reparse_retries: 0,
            timeout,
            emitter,
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_reparse_retries(mut self, retries: u32) -> Self {
        self.reparse_retries = retries;
        self
    }

    fn request(&self, prompt: String) -> InferenceRequest {
        InferenceRequest {
            system: self.system.clone(),
            model: self.model.clone(),
            ..InferenceRequest::new(prompt)
        }
    }
}

#[async_trait]
impl Executor for Nim {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Decision
    }

    async fn run(&self, event: &EventEnvelope) -> Outcome {
        let prompt = match self.prompt.render(&event.payload) {
            Ok(prompt) => prompt,
            Err(e) => return Outcome::validation(format!("cannot render prompt: {e}")),
        };

        let mut next_prompt = prompt.clone();
        let mut reparses = 0;
        loop {
            let call = self.provider.complete(self.request(next_prompt));
            let raw = match tokio::time::timeout(self.timeout, call).await {
                Err(_) => return Outcome::Timeout,
                Ok(Err(e)) => return Outcome::provider(e.to_string()),
                Ok(Ok(raw)) => raw,
            };

            match self.contract.parse(&raw) {
                Ok(payload) => return self.emitter.emit(event, vec![payload]),
                Err(reason) if reparses < self.reparse_retries => {
                    reparses += 1;
                    tracing::debug!(
                        binding = %self.emitter.binding(),
                        event_id = %event.id,
                        reparse = reparses,
                        reason = %reason,
                        "Response failed contract, asking again"
                    );
                    next_prompt = format!(
                        "{prompt}\n\nYour previous answer was:\n{raw}\n\nThat answer was rejected: {reason}. {}",
                        self.contract.reprompt()
                    );
                }
                Err(reason) => return Outcome::parse(reason, raw),
            }
        }
    }
}
