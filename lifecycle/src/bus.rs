//! In-process lifecycle event bus.
//!
//! Transaction and recovery flows publish a small, ordered vocabulary of
//! events keyed by transaction hash. Observers subscribe per event kind (and
//! optionally per subject hash) and receive events synchronously, in
//! registration order. Dispatch runs against a snapshot of the subscriber list
//! taken at publish time, so a handler may unsubscribe itself (or others)
//! without disturbing the delivery in progress.
//!
//! The bus does not reorder, deduplicate or coalesce. A handler that returns
//! an error does not stop delivery to later handlers; the error goes to the
//! fault sink.

use crate::error::EventError;
use crate::types::{Address, SafeTxHash};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// Event kinds a subscriber can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A transaction was proposed with its first signature
    Propose,
    /// An additional owner signature was added
    ConfirmPropose,
    /// Submitted for execution, awaiting finality
    Processing,
    /// Executed successfully
    Processed,
    /// Executed and reverted on-chain
    Reverted,
    /// Submission failed before reaching the chain
    Failed,
}

impl EventKind {
    /// Every kind, in lifecycle order
    pub const ALL: [EventKind; 6] = [
        EventKind::Propose,
        EventKind::ConfirmPropose,
        EventKind::Processing,
        EventKind::Processed,
        EventKind::Reverted,
        EventKind::Failed,
    ];

    /// Whether the kind ends a transaction's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Processed | EventKind::Reverted | EventKind::Failed
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LifecycleEvent {
    /// Transaction proposed
    Propose {
        /// Transaction hash
        subject: SafeTxHash,
    },
    /// Signature added
    ConfirmPropose {
        /// Transaction hash
        subject: SafeTxHash,
        /// Owner that signed
        signer: Address,
    },
    /// Execution submitted
    Processing {
        /// Transaction hash
        subject: SafeTxHash,
    },
    /// Execution succeeded
    Processed {
        /// Transaction hash
        subject: SafeTxHash,
    },
    /// Execution reverted
    Reverted {
        /// Transaction hash
        subject: SafeTxHash,
        /// Revert details
        error: EventError,
    },
    /// Submission failed
    Failed {
        /// Transaction hash
        subject: SafeTxHash,
        /// Failure details
        error: EventError,
    },
}

impl LifecycleEvent {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Propose { .. } => EventKind::Propose,
            LifecycleEvent::ConfirmPropose { .. } => EventKind::ConfirmPropose,
            LifecycleEvent::Processing { .. } => EventKind::Processing,
            LifecycleEvent::Processed { .. } => EventKind::Processed,
            LifecycleEvent::Reverted { .. } => EventKind::Reverted,
            LifecycleEvent::Failed { .. } => EventKind::Failed,
        }
    }

    /// Subject hash
    pub fn subject(&self) -> &SafeTxHash {
        match self {
            LifecycleEvent::Propose { subject }
            | LifecycleEvent::ConfirmPropose { subject, .. }
            | LifecycleEvent::Processing { subject }
            | LifecycleEvent::Processed { subject }
            | LifecycleEvent::Reverted { subject, .. }
            | LifecycleEvent::Failed { subject, .. } => subject,
        }
    }

    /// Error payload of failure variants
    pub fn error(&self) -> Option<&EventError> {
        match self {
            LifecycleEvent::Reverted { error, .. } | LifecycleEvent::Failed { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }
}

/// A handler failure reported to the fault sink
#[derive(Debug)]
pub struct Fault {
    /// Subscription whose handler failed
    pub subscription: u64,
    /// Kind of the event being delivered
    pub kind: EventKind,
    /// Subject of the event being delivered
    pub subject: SafeTxHash,
    /// Error returned by the handler
    pub error: anyhow::Error,
}

type Handler = Rc<RefCell<dyn FnMut(&LifecycleEvent) -> anyhow::Result<()>>>;
type FaultSink = Rc<RefCell<dyn FnMut(&Fault)>>;

struct Subscriber {
    id: u64,
    kind: EventKind,
    subject: Option<SafeTxHash>,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    fault_sink: Option<FaultSink>,
}

/// Handle returned by [`EventBus::subscribe`]
#[must_use = "dropping the handle keeps the subscription alive with no way to remove it"]
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    registry: Weak<RefCell<Registry>>,
}

impl Subscription {
    /// Subscription id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the subscription. Idempotent and safe during dispatch.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .borrow_mut()
                .subscribers
                .retain(|subscriber| subscriber.id != self.id);
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("next_id", &self.next_id)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// Single-threaded publish/subscribe bus. Cloning shares the registry.
#[derive(Clone, Default, Debug)]
pub struct EventBus {
    registry: Rc<RefCell<Registry>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Route handler errors to `sink` instead of the log
    pub fn set_fault_sink<F>(&self, sink: F)
    where
        F: FnMut(&Fault) + 'static,
    {
        self.registry.borrow_mut().fault_sink = Some(Rc::new(RefCell::new(sink)));
    }

    fn register(
        &self,
        kind: EventKind,
        subject: Option<SafeTxHash>,
        handler: Handler,
    ) -> Subscription {
        let mut registry = self.registry.borrow_mut();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.push(Subscriber {
            id,
            kind,
            subject,
            handler,
        });

        Subscription {
            id,
            registry: Rc::downgrade(&self.registry),
        }
    }

    /// Receive every event of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: FnMut(&LifecycleEvent) -> anyhow::Result<()> + 'static,
    {
        self.register(kind, None, Rc::new(RefCell::new(handler)))
    }

    /// Receive events of `kind` for one subject hash only
    pub fn subscribe_subject<F>(
        &self,
        kind: EventKind,
        subject: SafeTxHash,
        handler: F,
    ) -> Subscription
    where
        F: FnMut(&LifecycleEvent) -> anyhow::Result<()> + 'static,
    {
        self.register(kind, Some(subject), Rc::new(RefCell::new(handler)))
    }

    /// Number of live subscriptions for `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry
            .borrow()
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.kind == kind)
            .count()
    }

    /// Deliver `event` to its subscribers; returns how many handlers ran
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(u64, Handler)> = self
            .registry
            .borrow()
            .subscribers
            .iter()
            .filter(|subscriber| {
                subscriber.kind == kind
                    && subscriber
                        .subject
                        .as_ref()
                        .map_or(true, |subject| subject == event.subject())
            })
            .map(|subscriber| (subscriber.id, subscriber.handler.clone()))
            .collect();

        debug!(
            "Publishing {} for {} to {} subscriber(s)",
            kind,
            event.subject(),
            snapshot.len()
        );

        let mut delivered = 0;
        for (id, handler) in snapshot {
            let outcome = match handler.try_borrow_mut() {
                Ok(mut handler) => {
                    delivered += 1;
                    (&mut *handler)(&event)
                }
                Err(_) => Err(anyhow::anyhow!(
                    "subscriber {} re-entered while handling an earlier event",
                    id
                )),
            };

            if let Err(error) = outcome {
                self.report(Fault {
                    subscription: id,
                    kind,
                    subject: event.subject().clone(),
                    error,
                });
            }
        }

        delivered
    }

    fn report(&self, fault: Fault) {
        let sink = self.registry.borrow().fault_sink.clone();
        match sink {
            Some(sink) => match sink.try_borrow_mut() {
                Ok(mut sink) => (&mut *sink)(&fault),
                Err(_) => warn!("Fault sink busy, dropping fault: {:?}", fault),
            },
            None => warn!(
                "Subscriber {} failed on {} for {}: {:#}",
                fault.subscription, fault.kind, fault.subject, fault.error
            ),
        }
    }
}
