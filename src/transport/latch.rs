use std::future::Future;
use tokio::sync::watch;
use crate::error::{Error, Result};

/// A one-shot event that wakes every waiter with either success or a stored error.
///
/// The transport uses one latch per rendezvous: service accept, key exchange completion, and the
/// close event. A latch may be re-armed with [`clear`][Latch::clear] (the service accept latch is
/// cleared before every SSH_MSG_SERVICE_REQUEST).
pub(crate) struct Latch {
    name: &'static str,
    tx: watch::Sender<State>,
}

#[derive(Debug, Clone)]
enum State {
    Unset,
    Set,
    Failed(Error),
}

impl Latch {
    pub fn new(name: &'static str) -> Latch {
        let (tx, _rx) = watch::channel(State::Unset);
        Latch { name, tx }
    }

    pub fn set(&self) {
        log::trace!("setting latch {:?}", self.name);
        self.tx.send_replace(State::Set);
    }

    pub fn fail(&self, error: Error) {
        log::trace!("failing latch {:?}: {}", self.name, error);
        self.tx.send_replace(State::Failed(error));
    }

    pub fn clear(&self) {
        self.tx.send_replace(State::Unset);
    }

    pub fn is_set(&self) -> bool {
        !matches!(*self.tx.borrow(), State::Unset)
    }

    /// The stored error, if the latch was failed.
    pub fn error(&self) -> Option<Error> {
        match &*self.tx.borrow() {
            State::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Number of wait futures currently subscribed.
    pub fn waiter_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wait until the latch is set; the subscription is taken out eagerly, so a latch set after
    /// calling `wait` but before awaiting the future is not missed.
    pub fn wait(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let mut rx = self.tx.subscribe();
        let name = self.name;
        async move {
            loop {
                match &*rx.borrow_and_update() {
                    State::Set => return Ok(()),
                    State::Failed(error) => return Err(error.clone()),
                    State::Unset => {},
                }
                if rx.changed().await.is_err() {
                    log::trace!("latch {:?} was dropped while waiting", name);
                    return Err(Error::TransportClosed)
                }
            }
        }
    }

    /// Wait until the latch is set or failed, ignoring the outcome.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let wait = self.wait();
        async move { let _ = wait.await; }
    }
}
