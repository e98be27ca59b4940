//! External model providers, abstracted behind small async traits.
//!
//! Real providers (chat completion and embedding APIs) live outside this
//! crate; the engine only cares about these seams. The mock implementations
//! are deterministic so tests never touch the network.

use async_trait::async_trait;

use crate::errors::ProviderError;

/// Response from a chat completion call, with accounting fields the screening
/// cache records.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    pub tokens_used: u32,
    pub cost_usd: f64,
}

/// A chat-capable language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<ChatResponse, ProviderError>;
}

/// An embedding model with a fixed output dimensionality.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;

    /// Embed a batch of texts; the result is index-aligned with the input.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

pub mod mock {
    //! Deterministic in-process providers for tests and local runs.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Embeds text by hashing trigrams into a fixed-size unit vector. The
    /// same text always produces the same vector, and texts sharing
    /// vocabulary land near each other, which is enough for ranking tests.
    #[derive(Debug)]
    pub struct HashEmbedder {
        dim: usize,
    }

    impl HashEmbedder {
        pub fn new(dim: usize) -> Self {
            Self { dim: dim.max(8) }
        }

        fn embed_one(&self, text: &str) -> Vec<f32> {
            let mut vector = vec![0.0f32; self.dim];
            let lowered = text.to_lowercase();
            let bytes = lowered.as_bytes();
            if bytes.len() < 3 {
                vector[0] = 1.0;
                return vector;
            }
            for window in bytes.windows(3) {
                let digest = blake3::hash(window);
                let raw = u32::from_le_bytes(
                    digest.as_bytes()[..4]
                        .try_into()
                        .unwrap_or([0, 0, 0, 0]),
                );
                let slot = (raw as usize) % self.dim;
                vector[slot] += 1.0;
            }
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut vector {
                    *v /= norm;
                }
            }
            vector
        }
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        fn dim(&self) -> usize {
            self.dim
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|t| self.embed_one(t)).collect())
        }
    }

    /// Replays a fixed sequence of responses, then repeats the last one.
    /// Useful for scripting screen-then-answer flows in tests.
    pub struct ScriptedChat {
        responses: Vec<ChatResponse>,
        cursor: AtomicUsize,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedChat {
        pub fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses,
                cursor: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn single(text: impl Into<String>) -> Self {
            Self::new(vec![ChatResponse {
                text: text.into(),
                tokens_used: 64,
                cost_usd: 0.0001,
            }])
        }

        /// A chat mock whose first reply is a screening verdict and whose
        /// later replies are answers.
        pub fn screening(score: f64, decision: &str) -> ChatResponse {
            ChatResponse {
                text: format!(
                    "{{\"quality_score\": {score}, \"decision\": \"{decision}\", \"reasoning\": \"scripted\"}}"
                ),
                tokens_used: 48,
                cost_usd: 0.0001,
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn complete(
            &self,
            system: &str,
            user: &str,
        ) -> Result<ChatResponse, ProviderError> {
            self.calls
                .lock()
                .push((system.to_string(), user.to_string()));
            if self.responses.is_empty() {
                return Err(ProviderError::Other("scripted chat has no responses".into()));
            }
            let idx = self
                .cursor
                .fetch_add(1, Ordering::SeqCst)
                .min(self.responses.len() - 1);
            Ok(self.responses[idx].clone())
        }
    }

    /// Offline stand-in for a real chat provider: answers screening prompts
    /// with a fixed ACCEPT verdict and generation prompts with a one-line
    /// summary citing the first source. Keeps local runs coherent end-to-end
    /// without network access.
    pub struct StubModel {
        pub screen_score: f64,
    }

    impl Default for StubModel {
        fn default() -> Self {
            Self { screen_score: 7.5 }
        }
    }

    #[async_trait]
    impl ChatModel for StubModel {
        async fn complete(
            &self,
            system: &str,
            user: &str,
        ) -> Result<ChatResponse, ProviderError> {
            if system.contains("quality screener") {
                return Ok(ScriptedChat::screening(self.screen_score, "ACCEPT"));
            }
            let text = if user.contains("[1]") {
                "The cited sources describe the topic in question [1].".to_string()
            } else {
                "No sources were provided.".to_string()
            };
            Ok(ChatResponse {
                text,
                tokens_used: 32,
                cost_usd: 0.0,
            })
        }
    }

    /// Fails every call with the given error; for retry-path tests.
    pub struct FailingChat(pub ProviderError);

    #[async_trait]
    impl ChatModel for FailingChat {
        async fn complete(&self, _: &str, _: &str) -> Result<ChatResponse, ProviderError> {
            Err(self.0.clone())
        }
    }

}
