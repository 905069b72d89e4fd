//! A backend that answers every prompt with the prompt itself, split on
//! whitespace. It speaks the full backend protocol, so the orchestrator can
//! be exercised against a real process without model weights.

use async_trait::async_trait;
use backend_grpc_stubs::{ModelOptions, PredictOptions, Reply};
use infergate_backend_sdk::{BackendError, InferenceBackend, TokenSender};
use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct EchoSettings {
    /// Simulated weight loading time.
    pub load_delay: Duration,
    /// Pause between streamed words.
    pub token_delay: Duration,
}

#[derive(Debug, Default)]
pub struct EchoBackend {
    settings: EchoSettings,
    model: Mutex<Option<String>>,
}

impl EchoBackend {
    pub fn new(settings: EchoSettings) -> Self {
        Self {
            settings,
            model: Mutex::new(None),
        }
    }

    pub fn loaded_model(&self) -> Option<String> {
        self.model.lock().clone()
    }

    /// Words of the prompt up to the token limit or the first stop word.
    fn words(options: &PredictOptions) -> Vec<&str> {
        let limit = usize::try_from(options.tokens)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(usize::MAX);
        options
            .prompt
            .split_whitespace()
            .take_while(|w| !options.stop_prompts.iter().any(|stop| stop.as_str() == *w))
            .take(limit)
            .collect()
    }
}

/// Stable per-word token id.
fn token_id(word: &str) -> i32 {
    word.bytes()
        .fold(0i32, |acc, b| acc.wrapping_mul(31).wrapping_add(i32::from(b)))
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[async_trait]
impl InferenceBackend for EchoBackend {
    async fn load(&self, options: ModelOptions) -> Result<(), BackendError> {
        if !Path::new(&options.model_file).is_file() {
            return Err(BackendError::Failed(format!(
                "model file {} not found",
                options.model_file
            )));
        }
        if !self.settings.load_delay.is_zero() {
            tokio::time::sleep(self.settings.load_delay).await;
        }
        *self.model.lock() = Some(options.model);
        Ok(())
    }

    async fn predict(&self, options: PredictOptions) -> Result<Reply, BackendError> {
        let words = Self::words(&options);
        Ok(Reply {
            message: words.join(" ").into_bytes(),
            tokens: count(words.len()),
            prompt_tokens: count(options.prompt.split_whitespace().count()),
        })
    }

    async fn predict_stream(
        &self,
        options: PredictOptions,
        tokens: TokenSender,
    ) -> Result<(), BackendError> {
        let words = Self::words(&options);
        let last = words.len().saturating_sub(1);
        for (i, word) in words.iter().enumerate() {
            let text = if i == last {
                word.to_string()
            } else {
                format!("{word} ")
            };
            tokens
                .send(Reply {
                    message: text.into_bytes(),
                    tokens: 1,
                    prompt_tokens: 0,
                })
                .await?;
            if !self.settings.token_delay.is_zero() {
                tokio::time::sleep(self.settings.token_delay).await;
            }
        }
        Ok(())
    }

    async fn tokenize_string(&self, options: PredictOptions) -> Result<Vec<i32>, BackendError> {
        Ok(options.prompt.split_whitespace().map(token_id).collect())
    }
}
