use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use um_client::config::{RECEIVER_DELIVERY_QUEUE_SIZE, SOURCE_SEND_WINDOW};
use um_client::{
    errmsg, logger, CallbackResult, ClientError, Context, ContextAttribute, Deliverable, Message,
    OptionValue, Receiver, SendMode, Severity, Source, Topic, TopicAttribute,
};

const WAIT: Duration = Duration::from_secs(5);

fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[test]
fn test_context_deleted_last() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::create(ContextAttribute::new())?;
    let rcv = Receiver::create(&ctx, Topic::resolve(&ctx, "T", TopicAttribute::receiver())?, |_| Ok(()))?;
    let src = Source::create(&ctx, Topic::allocate(&ctx, "T", TopicAttribute::source())?, |_| Ok(()))?;

    assert!(matches!(ctx.delete(), Err(ClientError::Lifecycle(_))));
    assert!(errmsg().contains("1 source(s) and 1 receiver(s)"));

    rcv.delete()?;
    assert!(matches!(ctx.delete(), Err(ClientError::Lifecycle(_))));

    src.delete()?;
    ctx.delete()?;
    assert!(matches!(ctx.delete(), Err(ClientError::Lifecycle(_))));

    // Nothing binds to a deleted context.
    assert!(Topic::resolve(&ctx, "T", TopicAttribute::receiver()).is_err());
    Ok(())
}

#[test]
fn test_no_delivery_after_receiver_delete() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::create(ContextAttribute::new())?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let rcv = Receiver::create(&ctx, Topic::resolve(&ctx, "T", TopicAttribute::receiver())?, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));
        Ok(())
    })?;
    let src = Source::create(&ctx, Topic::allocate(&ctx, "T", TopicAttribute::source())?, |_| Ok(()))?;

    for _ in 0..20 {
        src.send(b"before", SendMode::Block)?;
    }
    assert!(eventually(|| calls.load(Ordering::SeqCst) > 0));
    rcv.delete()?;
    let after_delete = calls.load(Ordering::SeqCst);

    for _ in 0..20 {
        src.send(b"after", SendMode::Block)?;
    }
    thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), after_delete);

    src.delete()?;
    ctx.delete()?;
    Ok(())
}

/// Holds the first delivery until the test opens the gate.
struct Gated {
    entered: Mutex<mpsc::Sender<()>>,
    gate: Mutex<mpsc::Receiver<()>>,
    first: AtomicBool,
    delivered: AtomicUsize,
}

impl Deliverable for Gated {
    fn deliver(&self, _message: &Message<'_>) -> CallbackResult {
        if self.first.swap(false, Ordering::SeqCst) {
            self.entered.lock().unwrap().send(())?;
            self.gate.lock().unwrap().recv_timeout(WAIT)?;
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_flow_control() -> Result<(), Box<dyn std::error::Error>> {
    let mut cattr = ContextAttribute::new();
    cattr.setopt(SOURCE_SEND_WINDOW, OptionValue::Integer(1))?;
    cattr.setopt(RECEIVER_DELIVERY_QUEUE_SIZE, OptionValue::Integer(1))?;
    let ctx = Context::create(cattr)?;

    let (entered_tx, entered_rx) = mpsc::channel();
    let (open_tx, open_rx) = mpsc::channel();
    let gated = Arc::new(Gated {
        entered: Mutex::new(entered_tx),
        gate: Mutex::new(open_rx),
        first: AtomicBool::new(true),
        delivered: AtomicUsize::new(0),
    });
    let rcv = Receiver::with_deliverable(
        &ctx,
        Topic::resolve(&ctx, "T", TopicAttribute::receiver())?,
        gated.clone(),
    )?;
    let src = Source::create(&ctx, Topic::allocate(&ctx, "T", TopicAttribute::source())?, |_| Ok(()))?;

    // Unobstructed path: a blocking send returns.
    src.send(b"first", SendMode::Block)?;
    entered_rx.recv_timeout(WAIT)?;

    // With the receiver stalled, the window fills up and non-blocking sends are refused.
    let mut accepted = 1;
    let mut refused = false;
    for _ in 0..100 {
        match src.send(b"more", SendMode::NonBlock) {
            Ok(()) => accepted += 1,
            Err(ClientError::WouldBlock) => {
                refused = true;
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    assert!(refused);
    assert!(accepted < 100);
    assert!(errmsg().contains("would block"));

    open_tx.send(())?;
    src.send(b"last", SendMode::Block)?;
    accepted += 1;
    assert!(eventually(|| gated.delivered.load(Ordering::SeqCst) == accepted));

    rcv.delete()?;
    src.delete()?;
    ctx.delete()?;
    Ok(())
}

#[test]
fn test_failing_callbacks_do_not_stop_delivery() -> Result<(), Box<dyn std::error::Error>> {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    logger::install(move |severity, text: &str| {
        let thread = thread::current().name().unwrap_or_default().to_owned();
        sink.lock().unwrap().push((severity, text.to_owned(), thread));
        Ok(())
    });

    let ctx = Context::create(ContextAttribute::new())?;
    let (tx, rx) = mpsc::channel();
    let rcv = Receiver::create(&ctx, Topic::resolve(&ctx, "T", TopicAttribute::receiver())?, move |msg| {
        match msg.sequence_number() {
            0 => panic!("first message rejected"),
            1 => Err("second message rejected".into()),
            n => {
                tx.send(n)?;
                Ok(())
            }
        }
    })?;
    let src = Source::create(&ctx, Topic::allocate(&ctx, "T", TopicAttribute::source())?, |_| Ok(()))?;
    for _ in 0..3 {
        src.send(b"x", SendMode::Block)?;
    }
    assert_eq!(rx.recv_timeout(WAIT)?, 2);

    {
        let lines = lines.lock().unwrap();
        let reported = |severity: Severity, needle: &str| {
            lines.iter().any(|(s, text, thread)| {
                *s == severity
                    && text.contains(rcv.name())
                    && text.contains(needle)
                    && thread.ends_with("-dispatch")
            })
        };
        assert!(reported(Severity::Error, "panicked"));
        assert!(reported(Severity::Warning, "second message rejected"));
    }
    logger::clear();

    rcv.delete()?;
    src.delete()?;
    ctx.delete()?;
    Ok(())
}

#[test]
fn test_oversized_queues_fail_creation() -> Result<(), Box<dyn std::error::Error>> {
    for option in [SOURCE_SEND_WINDOW, RECEIVER_DELIVERY_QUEUE_SIZE] {
        let mut cattr = ContextAttribute::new();
        cattr.setopt(option, OptionValue::Integer(u64::MAX))?;
        assert!(matches!(Context::create(cattr), Err(ClientError::Creation(_))));
        assert!(errmsg().contains(option));
    }

    let ctx = Context::create(ContextAttribute::new())?;
    let mut tattr = TopicAttribute::source();
    tattr.setopt(SOURCE_SEND_WINDOW, OptionValue::Integer(u64::MAX))?;
    assert!(matches!(Topic::allocate(&ctx, "T", tattr), Err(ClientError::Resolution(_))));
    ctx.delete()?;
    Ok(())
}

#[test]
fn test_topics_released_with_their_objects() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::create(ContextAttribute::new())?;
    for i in 0..100 {
        let name = format!("churn.{}", i);
        let rcv = Receiver::create(&ctx, Topic::resolve(&ctx, &name, TopicAttribute::receiver())?, |_| Ok(()))?;
        let src = Source::create(&ctx, Topic::allocate(&ctx, &name, TopicAttribute::source())?, |_| Ok(()))?;
        src.send(b"x", SendMode::Block)?;
        rcv.delete()?;
        src.delete()?;
    }
    assert_eq!(ctx.stats().topics, 0);

    // A handle that is still waiting keeps its topic.
    let pending = Topic::resolve(&ctx, "pending", TopicAttribute::receiver())?;
    assert_eq!(ctx.stats().topics, 1);
    let rcv = Receiver::create(&ctx, pending, |_| Ok(()))?;
    rcv.delete()?;
    assert_eq!(ctx.stats().topics, 0);

    ctx.delete()?;
    Ok(())
}

#[test]
fn test_dropped_objects_release_the_context() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::create(ContextAttribute::new())?;
    {
        let _rcv = Receiver::create(&ctx, Topic::resolve(&ctx, "T", TopicAttribute::receiver())?, |_| Ok(()))?;
        let src = Source::create(&ctx, Topic::allocate(&ctx, "T", TopicAttribute::source())?, |_| Ok(()))?;
        src.send(b"bye", SendMode::Block)?;
        assert_eq!(ctx.stats().sources, 1);
        assert_eq!(ctx.stats().receivers, 1);
    }
    assert_eq!(ctx.stats().sources, 0);
    assert_eq!(ctx.stats().receivers, 0);
    ctx.delete()?;
    Ok(())
}
