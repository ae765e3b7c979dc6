//! Direct completion calls for requests that need no sandbox.

use futures::StreamExt;
use janus_agent_schema::InternalEvent;
use janus_completion::{ChatMessage, ChatRequest, CompletionClient, CompletionError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::FastPathConfig;
use crate::errors::{error_event, map_completion_error};
use crate::EventStream;

const CHANNEL_CAPACITY: usize = 64;
const MAX_RETRIES: usize = 1;

enum Interrupted {
    ClientGone,
    Provider(CompletionError),
}

#[derive(Clone)]
pub struct FastPathInvoker {
    client: CompletionClient,
    config: FastPathConfig,
}

impl FastPathInvoker {
    pub fn new(client: CompletionClient, config: FastPathConfig) -> Self {
        Self { client, config }
    }

    /// Streams the completion as content and reasoning tokens, ending in
    /// `Done`. Dropping the stream aborts the provider call.
    pub fn run(&self, messages: Vec<ChatMessage>) -> EventStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let invoker = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => debug!("client went away; fast-path call aborted"),
                _ = invoker.drive(messages, &tx) => {}
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn drive(&self, messages: Vec<ChatMessage>, tx: &mpsc::Sender<InternalEvent>) {
        let mut request = ChatRequest::new(self.config.model.clone(), messages);
        request.temperature = self.config.temperature;

        let mut emitted = false;
        let mut attempt = 0;
        loop {
            match self.stream_once(&request, tx, &mut emitted).await {
                Ok(()) => break,
                Err(Interrupted::ClientGone) => return,
                Err(Interrupted::Provider(err))
                    if !emitted && attempt < MAX_RETRIES && err.is_transient() =>
                {
                    attempt += 1;
                    warn!(error = %err, attempt, "fast-path completion failed; retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(Interrupted::Provider(err)) => {
                    let err = map_completion_error(err);
                    warn!(error = %err, emitted, "fast-path completion failed");
                    if tx.send(error_event(&err)).await.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
        let _ = tx.send(InternalEvent::Done).await;
    }

    async fn stream_once(
        &self,
        request: &ChatRequest,
        tx: &mpsc::Sender<InternalEvent>,
        emitted: &mut bool,
    ) -> Result<(), Interrupted> {
        let mut stream = self
            .client
            .stream_chat(request)
            .await
            .map_err(Interrupted::Provider)?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Interrupted::Provider)?;
            let events = chunk
                .reasoning
                .filter(|text| !text.is_empty())
                .map(InternalEvent::reasoning)
                .into_iter()
                .chain(
                    chunk
                        .content
                        .filter(|text| !text.is_empty())
                        .map(InternalEvent::content),
                );
            for event in events {
                *emitted = true;
                tx.send(event).await.map_err(|_| Interrupted::ClientGone)?;
            }
        }
        Ok(())
    }
}
