//! Type-erased handler adapters
//!
//! Registration captures the user's handler closure together with its
//! message type. Workers only see raw messages, so the adapters here decode
//! each payload into the declared type and call the closure.

use crate::consumer::context::HandlerContext;
use crate::consumer::retry::RetryExecutor;
use crate::message::{Envelope, RawMessage};
use crate::registry::Consumer;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Outcome of handing one batch to a handler
#[derive(Debug, Default)]
pub(crate) struct Invocation {
    /// Messages that could not be decoded, by batch index
    pub undecodable: Vec<(usize, String)>,
    /// Messages the handler accepted
    pub handled: usize,
    /// Messages the handler failed on, by batch index
    pub failed: Vec<(usize, String)>,
    /// Last handler error
    pub error: Option<anyhow::Error>,
    /// Retries spent across the batch
    pub retries: u32,
}

impl Invocation {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    /// Declared message type name
    fn message_type(&self) -> &'static str;

    /// True for handlers that take the whole batch
    fn is_bulk(&self) -> bool;

    /// Decode and dispatch `messages`.
    ///
    /// Single-message handlers stop at the first message that still fails
    /// after retries unless `keep_going` is set.
    async fn invoke(
        &self,
        messages: &[RawMessage],
        ctx: &HandlerContext,
        retry: &RetryExecutor,
        keep_going: bool,
    ) -> Invocation;
}

pub(crate) struct SingleHandler<C, M, F> {
    consumer: Arc<C>,
    handler: F,
    _message: PhantomData<fn() -> M>,
}

impl<C, M, F> SingleHandler<C, M, F> {
    pub fn new(consumer: Arc<C>, handler: F) -> Self {
        Self {
            consumer,
            handler,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<C, M, F, Fut> ErasedHandler for SingleHandler<C, M, F>
where
    C: Consumer,
    M: DeserializeOwned + Send + 'static,
    F: Fn(Arc<C>, Envelope<M>, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn message_type(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn is_bulk(&self) -> bool {
        false
    }

    async fn invoke(
        &self,
        messages: &[RawMessage],
        ctx: &HandlerContext,
        retry: &RetryExecutor,
        keep_going: bool,
    ) -> Invocation {
        let mut invocation = Invocation::default();

        for (index, raw) in messages.iter().enumerate() {
            let envelope = match Envelope::<M>::decode(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    invocation.undecodable.push((index, e.to_string()));
                    continue;
                }
            };

            // The first attempt consumes the decoded envelope; retries decode again.
            let mut first = Some(envelope);
            let result = retry
                .execute(|attempt| {
                    let envelope = match first.take() {
                        Some(envelope) => Ok(envelope),
                        None => Envelope::<M>::decode(raw),
                    };
                    let call = envelope
                        .map(|e| (self.handler)(self.consumer.clone(), e, ctx.with_attempt(attempt)));
                    async move {
                        match call {
                            Ok(fut) => fut.await,
                            Err(e) => Err(anyhow::Error::new(e)),
                        }
                    }
                })
                .await;

            invocation.retries += result.attempts();
            match result.into_result() {
                Ok(()) => invocation.handled += 1,
                Err(error) => {
                    warn!(
                        binding = ctx.binding_id(),
                        tag = %raw.tag,
                        %error,
                        "handler failed"
                    );
                    invocation.failed.push((index, format!("{:#}", error)));
                    invocation.error = Some(error);
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        invocation
    }
}

pub(crate) struct BulkHandler<C, M, F> {
    consumer: Arc<C>,
    handler: F,
    _message: PhantomData<fn() -> M>,
}

impl<C, M, F> BulkHandler<C, M, F> {
    pub fn new(consumer: Arc<C>, handler: F) -> Self {
        Self {
            consumer,
            handler,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<C, M, F, Fut> ErasedHandler for BulkHandler<C, M, F>
where
    C: Consumer,
    M: DeserializeOwned + Send + 'static,
    F: Fn(Arc<C>, Vec<Envelope<M>>, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn message_type(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn is_bulk(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        messages: &[RawMessage],
        ctx: &HandlerContext,
        retry: &RetryExecutor,
        _keep_going: bool,
    ) -> Invocation {
        let mut invocation = Invocation::default();
        let mut decodable = Vec::with_capacity(messages.len());
        let mut envelopes = Vec::with_capacity(messages.len());
        for (index, raw) in messages.iter().enumerate() {
            match Envelope::<M>::decode(raw) {
                Ok(envelope) => {
                    decodable.push(index);
                    envelopes.push(envelope);
                }
                Err(e) => invocation.undecodable.push((index, e.to_string())),
            }
        }
        if decodable.is_empty() {
            return invocation;
        }

        // The first attempt consumes the decoded batch; retries decode again.
        let mut first = Some(envelopes);
        let result = retry
            .execute(|attempt| {
                let envelopes = first.take().unwrap_or_else(|| {
                    decodable
                        .iter()
                        .filter_map(|&i| Envelope::<M>::decode(&messages[i]).ok())
                        .collect()
                });
                (self.handler)(self.consumer.clone(), envelopes, ctx.with_attempt(attempt))
            })
            .await;

        invocation.retries = result.attempts();
        match result.into_result() {
            Ok(()) => invocation.handled = decodable.len(),
            Err(error) => {
                warn!(
                    binding = ctx.binding_id(),
                    messages = decodable.len(),
                    %error,
                    "bulk handler failed"
                );
                let reason = format!("{:#}", error);
                invocation.failed = decodable.into_iter().map(|i| (i, reason.clone())).collect();
                invocation.error = Some(error);
            }
        }

        invocation
    }
}
