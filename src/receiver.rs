//!
//! Subscribe-side endpoint.
//!
use crate::callback::{CallbackBinding, CallbackResult, Deliverable};
use crate::context::{self, Context, Endpoint, Shared};
use crate::error::{self, ClientError};
use crate::message::{Delivery, Message};
use crate::resolver::ReceiverPort;
use crate::topic::{Role, Topic};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub struct Receiver {
    shared: Arc<Shared>,
    id: u64,
    name: Arc<str>,
    topic: Arc<str>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Receiver {
    /// Creates a receiver bound to `topic`, which must come from [`Topic::resolve`] on
    /// the same context.
    ///
    /// `on_message` runs on a dispatch thread once per message. Messages from one source
    /// arrive in sequence-number order; there is no ordering across sources.
    pub fn create<F>(ctx: &Context, topic: Topic, on_message: F) -> Result<Receiver, ClientError>
    where
        F: Fn(&Message<'_>) -> CallbackResult + Send + Sync + 'static,
    {
        error::track(Self::bind(ctx, topic, Arc::new(on_message)))
    }

    pub fn with_deliverable(
        ctx: &Context,
        topic: Topic,
        deliverable: Arc<dyn Deliverable>,
    ) -> Result<Receiver, ClientError> {
        error::track(Self::bind(ctx, topic, deliverable))
    }

    fn bind(ctx: &Context, topic: Topic, deliverable: Arc<dyn Deliverable>) -> Result<Receiver, ClientError> {
        let shared = Arc::clone(ctx.shared());
        if topic.role() != Role::Subscribe {
            return Err(ClientError::Creation(format!(
                "topic `{}` was allocated for publishing; resolve it to subscribe",
                topic.name()
            )));
        }
        if topic.context_id != shared.id {
            return Err(ClientError::Creation(format!(
                "topic `{}` belongs to another context",
                topic.name()
            )));
        }
        shared.attach(Endpoint::Receiver)?;

        let id = context::next_id();
        let name: Arc<str> = Arc::from(format!("RCV:{}:{}:{}", shared.name, shared.id, id));
        let topic_name = topic.shared_name();

        let (queue, inbox) = mpsc::channel(shared.delivery_queue);
        let (stop, stopped) = oneshot::channel();
        let binding = CallbackBinding::new(Arc::clone(&name), deliverable);
        let task = shared
            .handle
            .spawn(run_delivery(Arc::clone(&shared), binding, inbox, stopped));

        let sources = shared.resolver.bind_receiver(
            &topic_name,
            ReceiverPort {
                id,
                name: Arc::clone(&name),
                queue,
                control_messages: topic.config.control_messages,
            },
        );
        for source in &sources {
            shared.announce(&topic_name, source);
        }
        tracing::debug!(topic = %topic_name, receiver = %name, sources = sources.len(), "receiver created");

        Ok(Receiver {
            shared,
            id,
            name,
            topic: topic_name,
            stop: Some(stop),
            task: Some(task),
        })
    }

    /// Identifier sources see in their connect and disconnect events.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic_name(&self) -> &str {
        &self.topic
    }

    /// Deletes the receiver. Returns after the in-flight delivery callback, if any, has
    /// finished; no callback runs afterward.
    ///
    /// # Errors
    /// `ClientError::Lifecycle` when called from inside an async runtime. The receiver
    /// is still unbound and released, but an in-flight callback may outlive the call.
    pub fn delete(mut self) -> Result<(), ClientError> {
        if context::in_async_context() {
            return error::track(Err(ClientError::Lifecycle(
                "a receiver cannot be deleted from inside an async runtime".to_owned(),
            )));
        }
        self.close(true);
        Ok(())
    }

    fn close(&mut self, wait: bool) {
        let stop = match self.stop.take() {
            Some(stop) => stop,
            None => return,
        };
        self.shared.resolver.unbind_receiver(&self.topic, self.id);
        let _ = stop.send(());

        if let Some(task) = self.task.take() {
            if wait {
                if let Err(e) = self.shared.handle.block_on(task) {
                    tracing::warn!(receiver = %self.name, "delivery task failed: {}", e);
                }
            }
        }
        self.shared.detach(Endpoint::Receiver);
        tracing::debug!(receiver = %self.name, "receiver deleted");
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.close(!context::in_async_context());
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .finish()
    }
}

async fn run_delivery(
    shared: Arc<Shared>,
    binding: CallbackBinding<dyn Deliverable>,
    mut inbox: mpsc::Receiver<Delivery>,
    mut stopped: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            // Stop wins over queued messages.
            biased;

            _ = &mut stopped => break,
            delivery = inbox.recv() => {
                let delivery = match delivery {
                    Some(delivery) => delivery,
                    None => break,
                };
                let message = delivery.view();
                tokio::task::block_in_place(|| binding.invoke(|deliverable| deliverable.deliver(&message)));
                if message.kind().is_data() {
                    shared.count_delivered();
                }
            }
        }
    }
}
