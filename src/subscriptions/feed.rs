//! One change feed per collection, fanned out to every emitter on it.

use super::emitter::Command;
use crate::error::Result;
use crate::store::{DocumentStore, FeedEvent};
use crossbeam_channel::{bounded, select, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

type Inboxes = Arc<RwLock<HashMap<u64, Sender<Command>>>>;

/// Shared change feed for one collection.
///
/// A pump thread forwards every feed event to the inboxes of the attached
/// emitters. If the feed fails or closes on its own, every attached emitter
/// is told and the handle is marked dead.
pub struct ChangeFeedHandle {
    collection: String,
    inboxes: Inboxes,
    alive: Arc<AtomicBool>,
    close_tx: Option<Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl ChangeFeedHandle {
    /// Open the store's feed for `collection` and start fanning it out.
    pub fn open(store: &dyn DocumentStore, collection: &str) -> Result<Self> {
        let feed = store.watch(collection)?;
        let inboxes: Inboxes = Arc::new(RwLock::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (close_tx, close_rx) = bounded::<()>(1);

        let pump_inboxes = Arc::clone(&inboxes);
        let pump_alive = Arc::clone(&alive);
        let name = collection.to_string();

        let pump = std::thread::Builder::new()
            .name(format!("feed-{}", collection))
            .spawn(move || {
                loop {
                    select! {
                        recv(feed.receiver()) -> msg => match msg {
                            Ok(FeedEvent::Change(change)) => {
                                fan_out(&pump_inboxes, || Command::Feed(FeedEvent::Change(change.clone())));
                            }
                            Ok(FeedEvent::Error(message)) => {
                                warn!(collection = %name, %message, "change feed failed");
                                pump_alive.store(false, Ordering::SeqCst);
                                fan_out(&pump_inboxes, || Command::Feed(FeedEvent::Error(message.clone())));
                                break;
                            }
                            Err(_) => {
                                warn!(collection = %name, "change feed closed unexpectedly");
                                pump_alive.store(false, Ordering::SeqCst);
                                fan_out(&pump_inboxes, || {
                                    Command::Feed(FeedEvent::Error(format!(
                                        "change feed for {} closed unexpectedly",
                                        name
                                    )))
                                });
                                break;
                            }
                        },
                        recv(close_rx) -> _ => break,
                    }
                }
                // Dropping the feed here closes it on the store side.
                drop(feed);
                debug!(collection = %name, "change feed pump stopped");
            })?;

        debug!(collection, "change feed handle opened");
        Ok(Self {
            collection: collection.to_string(),
            inboxes,
            alive,
            close_tx: Some(close_tx),
            pump: Some(pump),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Start delivering events to an emitter's inbox.
    pub fn attach(&self, emitter_id: u64, inbox: Sender<Command>) {
        self.inboxes.write().insert(emitter_id, inbox);
    }

    /// Stop delivering events to an emitter.
    pub fn detach(&self, emitter_id: u64) -> bool {
        self.inboxes.write().remove(&emitter_id).is_some()
    }

    /// Number of attached emitters.
    pub fn emitter_count(&self) -> usize {
        self.inboxes.read().len()
    }

    /// False once the underlying feed has failed or closed on its own.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop the pump and close the underlying feed. Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                warn!(collection = %self.collection, "change feed pump panicked");
            }
            debug!(collection = %self.collection, "change feed handle closed");
        }
        self.alive.store(false, Ordering::SeqCst);
        self.inboxes.write().clear();
    }
}

impl Drop for ChangeFeedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn fan_out<F>(inboxes: &Inboxes, make: F)
where
    F: Fn() -> Command,
{
    let mut gone = Vec::new();
    {
        let inboxes = inboxes.read();
        for (id, inbox) in inboxes.iter() {
            if inbox.send(make()).is_err() {
                gone.push(*id);
            }
        }
    }
    if !gone.is_empty() {
        let mut inboxes = inboxes.write();
        for id in gone {
            inboxes.remove(&id);
        }
    }
}
