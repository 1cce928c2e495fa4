//!
//! Publish-side endpoint.
//!
use crate::callback::{CallbackBinding, CallbackResult, SourceEvent, SourceEventHandler};
use crate::context::{self, Context, Endpoint, Shared};
use crate::error::{self, ClientError};
use crate::message::{Delivery, MessageKind};
use crate::resolver::{PeerEvent, ReceiverPort, SourcePort};
use crate::topic::{Role, Topic};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Wait, without timeout, until flow control admits the message.
    Block,

    /// Fail with `ClientError::WouldBlock` when flow control is engaged.
    NonBlock,
}

pub struct Source {
    shared: Arc<Shared>,
    id: u64,
    identifier: Arc<str>,
    topic: Arc<str>,
    admission: Option<mpsc::Sender<Bytes>>,
    dispatch: Option<JoinHandle<()>>,
    events: Option<JoinHandle<()>>,
}

impl Source {
    /// Creates a source bound to `topic`, which must come from [`Topic::allocate`] on
    /// the same context.
    ///
    /// `on_event` runs on a dispatch thread each time a receiver connects or
    /// disconnects. It must return quickly and must not delete this source.
    pub fn create<F>(ctx: &Context, topic: Topic, on_event: F) -> Result<Source, ClientError>
    where
        F: Fn(&SourceEvent<'_>) -> CallbackResult + Send + Sync + 'static,
    {
        error::track(Self::bind(ctx, topic, Arc::new(on_event)))
    }

    pub fn with_handler(
        ctx: &Context,
        topic: Topic,
        handler: Arc<dyn SourceEventHandler>,
    ) -> Result<Source, ClientError> {
        error::track(Self::bind(ctx, topic, handler))
    }

    fn bind(ctx: &Context, topic: Topic, handler: Arc<dyn SourceEventHandler>) -> Result<Source, ClientError> {
        let shared = Arc::clone(ctx.shared());
        if topic.role() != Role::Publish {
            return Err(ClientError::Creation(format!(
                "topic `{}` was resolved for subscribing; allocate it to publish",
                topic.name()
            )));
        }
        if topic.context_id != shared.id {
            return Err(ClientError::Creation(format!(
                "topic `{}` belongs to another context",
                topic.name()
            )));
        }
        shared.attach(Endpoint::Source)?;

        let id = context::next_id();
        let identifier: Arc<str> = Arc::from(format!("SRC:{}:{}:{}", shared.name, shared.id, id));
        let name = topic.shared_name();
        let window = topic.config.send_window.unwrap_or(shared.send_window);

        let (admission, inbound) = mpsc::channel(window);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let binding = CallbackBinding::new(Arc::clone(&identifier), handler);
        let events = shared.handle.spawn(run_events(binding, event_rx));
        let dispatch = shared.handle.spawn(run_dispatch(
            Arc::clone(&shared),
            Arc::clone(&name),
            Arc::clone(&identifier),
            inbound,
        ));

        shared.resolver.advertise_source(
            &name,
            SourcePort {
                id,
                name: Arc::clone(&identifier),
                events: event_tx,
            },
        );
        shared.announce(&name, &identifier);
        tracing::debug!(topic = %name, source = %identifier, window, "source created");

        Ok(Source {
            shared,
            id,
            identifier,
            topic: name,
            admission: Some(admission),
            dispatch: Some(dispatch),
            events: Some(events),
        })
    }

    /// Identifier string receivers see in [`Message::source`](crate::message::Message::source).
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn topic_name(&self) -> &str {
        &self.topic
    }

    /// Sends one message.
    ///
    /// # Errors
    /// `ClientError::WouldBlock` in [`SendMode::NonBlock`] when the send window is full.
    /// `ClientError::Lifecycle` for a blocking send issued from inside an async runtime,
    /// such as from a callback.
    pub fn send(&self, payload: &[u8], mode: SendMode) -> Result<(), ClientError> {
        error::track(self.admit(payload, mode))
    }

    fn admit(&self, payload: &[u8], mode: SendMode) -> Result<(), ClientError> {
        let admission = self
            .admission
            .as_ref()
            .ok_or_else(|| ClientError::Lifecycle("source is deleted".to_owned()))?;
        let payload = Bytes::copy_from_slice(payload);

        match mode {
            SendMode::Block => {
                if context::in_async_context() {
                    return Err(ClientError::Lifecycle(
                        "blocking send from inside an async runtime; use SendMode::NonBlock".to_owned(),
                    ));
                }
                admission
                    .blocking_send(payload)
                    .map_err(|_| ClientError::Lifecycle("source dispatch has stopped".to_owned()))?;
            }
            SendMode::NonBlock => admission.try_send(payload).map_err(|e| match e {
                TrySendError::Full(_) => ClientError::WouldBlock,
                TrySendError::Closed(_) => ClientError::Lifecycle("source dispatch has stopped".to_owned()),
            })?,
        }
        self.shared.count_sent();
        Ok(())
    }

    /// Deletes the source. Messages already admitted are still delivered; returns once
    /// every callback related to this source has finished.
    ///
    /// # Errors
    /// `ClientError::Lifecycle` when called from inside an async runtime. The source is
    /// still released in that case, but without waiting for admitted messages to drain
    /// or for its event callback to return.
    pub fn delete(mut self) -> Result<(), ClientError> {
        if context::in_async_context() {
            return error::track(Err(ClientError::Lifecycle(
                "a source cannot be deleted from inside an async runtime".to_owned(),
            )));
        }
        self.close(true);
        Ok(())
    }

    fn close(&mut self, wait: bool) {
        let admission = match self.admission.take() {
            Some(admission) => admission,
            None => return,
        };
        // Dropping the port closes the event queue once the pending events are drained.
        drop(self.shared.resolver.withdraw_source(&self.topic, self.id));
        drop(admission);

        for task in [self.dispatch.take(), self.events.take()].into_iter().flatten() {
            if wait {
                if let Err(e) = self.shared.handle.block_on(task) {
                    tracing::warn!(source = %self.identifier, "source task failed: {}", e);
                }
            }
        }
        self.shared.detach(Endpoint::Source);
        tracing::debug!(source = %self.identifier, "source deleted");
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.close(!context::in_async_context());
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("identifier", &self.identifier)
            .field("topic", &self.topic)
            .finish()
    }
}

async fn run_events(
    binding: CallbackBinding<dyn SourceEventHandler>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let view = match &event {
            PeerEvent::Connect(receiver) => SourceEvent::Connect { receiver: &**receiver },
            PeerEvent::Disconnect(receiver) => SourceEvent::Disconnect { receiver: &**receiver },
        };
        tokio::task::block_in_place(|| binding.invoke(|handler| handler.on_event(&view)));
    }
}

/// Moves admitted messages to every receiver bound to the topic, numbering them in
/// admission order. Waiting on a full receiver queue stalls admission, which is what
/// makes blocking sends block.
async fn run_dispatch(
    shared: Arc<Shared>,
    topic: Arc<str>,
    source: Arc<str>,
    mut inbound: mpsc::Receiver<Bytes>,
) {
    let mut sequence: u32 = 0;
    let mut sessions = Sessions::default();

    while let Some(payload) = inbound.recv().await {
        let delivery = Delivery {
            kind: MessageKind::Data,
            payload,
            topic_name: Arc::clone(&topic),
            source: Arc::clone(&source),
            sequence_number: sequence,
        };
        for port in shared.resolver.receivers(&topic) {
            sessions.deliver(&port, &delivery).await;
        }
        sequence = sequence.wrapping_add(1);
    }

    sessions.end(&delivery_end(&topic, &source, sequence)).await;
}

/// Receivers this source has delivered to and that are still reachable.
#[derive(Default)]
struct Sessions {
    open: HashMap<u64, ReceiverPort>,
}

impl Sessions {
    async fn deliver(&mut self, port: &ReceiverPort, delivery: &Delivery) {
        if !self.open.contains_key(&port.id) {
            if port.control_messages {
                let _ = port
                    .queue
                    .send(control(delivery, MessageKind::BeginningOfSession))
                    .await;
            }
            self.open.insert(port.id, port.clone());
        }
        if port.queue.send(delivery.clone()).await.is_err() {
            tracing::trace!(receiver = %port.name, "receiver gone, message dropped");
            self.open.remove(&port.id);
        }
    }

    async fn end(self, end: &Delivery) {
        for port in self.open.values().filter(|port| port.control_messages) {
            let _ = port.queue.send(end.clone()).await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.open.len()
    }
}

fn delivery_end(topic: &Arc<str>, source: &Arc<str>, sequence: u32) -> Delivery {
    Delivery {
        kind: MessageKind::EndOfSession,
        payload: Bytes::new(),
        topic_name: Arc::clone(topic),
        source: Arc::clone(source),
        sequence_number: sequence,
    }
}

fn control(delivery: &Delivery, kind: MessageKind) -> Delivery {
    Delivery {
        kind,
        payload: Bytes::new(),
        topic_name: Arc::clone(&delivery.topic_name),
        source: Arc::clone(&delivery.source),
        sequence_number: delivery.sequence_number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextAttribute, OptionValue, TopicAttribute, SOURCE_SEND_WINDOW};

    fn noop(_: &SourceEvent<'_>) -> CallbackResult {
        Ok(())
    }

    #[test]
    fn test_send_without_receivers() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = Context::create(ContextAttribute::new())?;
        let topic = Topic::allocate(&ctx, "orphan", TopicAttribute::source())?;
        let src = Source::create(&ctx, topic, noop)?;
        assert!(src.identifier().starts_with("SRC:default:"));
        assert_eq!(src.topic_name(), "orphan");
        for i in 0..10 {
            src.send(format!("message{}", i).as_bytes(), SendMode::Block)?;
        }
        assert_eq!(ctx.stats().messages_sent, 10);
        src.delete()?;
        ctx.delete()?;
        Ok(())
    }

    #[test]
    fn test_create_rejects_wrong_topic() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = Context::create(ContextAttribute::new())?;
        let other = Context::create(ContextAttribute::new())?;

        let topic = Topic::resolve(&ctx, "T", TopicAttribute::receiver())?;
        assert!(matches!(Source::create(&ctx, topic, noop), Err(ClientError::Creation(_))));

        let foreign = Topic::allocate(&other, "T", TopicAttribute::source())?;
        assert!(matches!(Source::create(&ctx, foreign, noop), Err(ClientError::Creation(_))));
        assert!(error::errmsg().contains("another context"));

        assert_eq!(ctx.stats().sources, 0);
        ctx.delete()?;
        other.delete()?;
        Ok(())
    }

    #[test]
    fn test_topic_window_overrides_context() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = Context::create(ContextAttribute::new())?;
        let mut attr = TopicAttribute::source();
        attr.setopt(SOURCE_SEND_WINDOW, OptionValue::Integer(4))?;
        let topic = Topic::allocate(&ctx, "small", attr)?;
        let src = Source::create(&ctx, topic, noop)?;
        assert_eq!(src.admission.as_ref().map(|a| a.max_capacity()), Some(4));
        drop(src);
        ctx.delete()?;
        Ok(())
    }

    fn port(id: u64, capacity: usize) -> (ReceiverPort, mpsc::Receiver<Delivery>) {
        let (queue, inbox) = mpsc::channel(capacity);
        let port = ReceiverPort {
            id,
            name: Arc::from(format!("RCV:{}", id)),
            queue,
            control_messages: true,
        };
        (port, inbox)
    }

    #[tokio::test]
    async fn test_sessions_forget_closed_receivers() {
        let topic: Arc<str> = Arc::from("T");
        let source: Arc<str> = Arc::from("SRC:1");
        let data = Delivery {
            kind: MessageKind::Data,
            payload: Bytes::from_static(b"tick"),
            topic_name: Arc::clone(&topic),
            source: Arc::clone(&source),
            sequence_number: 0,
        };

        let mut sessions = Sessions::default();
        let (live, mut live_inbox) = port(1, 8);
        let (gone, gone_inbox) = port(2, 8);
        drop(gone_inbox);

        sessions.deliver(&live, &data).await;
        sessions.deliver(&gone, &data).await;
        assert_eq!(sessions.len(), 1);

        sessions.end(&delivery_end(&topic, &source, 1)).await;
        let kinds: Vec<_> = std::iter::from_fn(|| live_inbox.try_recv().ok())
            .map(|delivery| (delivery.kind, delivery.sequence_number))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (MessageKind::BeginningOfSession, 0),
                (MessageKind::Data, 0),
                (MessageKind::EndOfSession, 1),
            ]
        );
    }

    #[test]
    fn test_delete_inside_runtime_releases_source() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = Context::create(ContextAttribute::new())?;
        let topic = Topic::allocate(&ctx, "T", TopicAttribute::source())?;
        let src = Source::create(&ctx, topic, noop)?;

        let outer = tokio::runtime::Builder::new_current_thread().build()?;
        let refused = outer.block_on(async { src.delete() });
        assert!(matches!(refused, Err(ClientError::Lifecycle(_))));
        assert!(error::errmsg().contains("async runtime"));
        assert_eq!(ctx.stats().sources, 0);

        drop(outer);
        ctx.delete()?;
        Ok(())
    }
}
