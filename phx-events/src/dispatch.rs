//! Per-event dispatch worker.
//!
//! Each event category runs one tokio task that drains its queue in order
//! and hands every envelope to the category's handlers, one at a time.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::message::{ChannelEvent, ChannelMessage};
use crate::queue::QueueReceiver;
use crate::registry::{HandlerEntry, HandlerList};

/// Spawn the dispatch worker for one event category
pub(crate) fn spawn_worker(
    event: ChannelEvent,
    receiver: QueueReceiver,
    handlers: HandlerList,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(worker_loop(event, receiver, handlers, shutdown))
}

async fn worker_loop(
    event: ChannelEvent,
    mut receiver: QueueReceiver,
    handlers: HandlerList,
    shutdown: CancellationToken,
) {
    loop {
        // Shutdown wins over pending envelopes; the one being handled below
        // always runs to completion.
        let envelope = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(event = %event, "Dispatch worker cancelled");
                return;
            }
            next = receiver.recv() => match next {
                Some(envelope) => envelope,
                None => {
                    debug!(event = %event, "Event queue closed");
                    return;
                }
            },
        };

        dispatch(&envelope, &handlers).await;
    }
}

/// Run every matching handler for one envelope, in registration order
async fn dispatch(message: &ChannelMessage, handlers: &HandlerList) {
    // Snapshot so register/unregister never wait on a running handler
    let snapshot: Vec<Arc<HandlerEntry>> = handlers.read().clone();

    for entry in snapshot {
        if !entry.accepts(message.topic().as_str()) {
            trace!(
                handler = entry.handler.name(),
                topic = %message.topic(),
                "Topic filter rejected envelope"
            );
            continue;
        }
        invoke(&entry, message).await;
    }
}

async fn invoke(entry: &HandlerEntry, message: &ChannelMessage) {
    let outcome = AssertUnwindSafe(entry.handler.handle(message))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(
                handler = entry.handler.name(),
                topic = %message.topic(),
                event = %message.event(),
                ref_ = ?message.ref_().map(|r| r.as_str()),
                error = %format_args!("{err:#}"),
                "Handler failed"
            );
        }
        Err(panic) => {
            error!(
                handler = entry.handler.name(),
                topic = %message.topic(),
                event = %message.event(),
                ref_ = ?message.ref_().map(|r| r.as_str()),
                panic = panic_message(&*panic),
                "Handler panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
