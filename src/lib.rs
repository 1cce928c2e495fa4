//! This crate provides the client-side runtime of a reliable publish/subscribe messaging engine:
//! join a messaging domain with a [`Context`], resolve or allocate [`Topic`]s, publish with a
//! [`Source`] and receive asynchronously through a [`Receiver`] callback.
//!
//! ```no_run
//! use um_client::{Context, ContextAttribute, Receiver, SendMode, Source, Topic, TopicAttribute};
//!
//! fn main() -> Result<(), um_client::ClientError> {
//!     let ctx = Context::create(ContextAttribute::new())?;
//!
//!     let topic = Topic::resolve(&ctx, "greetings", TopicAttribute::receiver())?;
//!     let rcv = Receiver::create(&ctx, topic, |msg| {
//!         println!("{}: {:?}", msg.sequence_number(), msg.data());
//!         Ok(())
//!     })?;
//!
//!     let topic = Topic::allocate(&ctx, "greetings", TopicAttribute::source())?;
//!     let src = Source::create(&ctx, topic, |_| Ok(()))?;
//!     src.send(b"hello", SendMode::Block)?;
//!
//!     rcv.delete()?;
//!     src.delete()?;
//!     ctx.delete()
//! }
//! ```
pub mod callback;
pub mod config;
pub mod context;
pub mod error;
pub mod logger;
pub mod message;
pub mod receiver;
mod resolver;
pub mod source;
pub mod topic;

pub use callback::{CallbackBinding, CallbackError, CallbackResult, Deliverable, SourceEvent, SourceEventHandler, SourceNotifier};
pub use config::{ContextAttribute, OptionValue, TopicAttribute};
pub use context::{Context, ContextStats};
pub use error::{errmsg, ClientError, Result};
pub use logger::Severity;
pub use message::{Message, MessageKind};
pub use receiver::Receiver;
pub use source::{SendMode, Source};
pub use topic::{Role, Topic};
