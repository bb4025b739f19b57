//! Timers and at-least-once resubmission of protocol messages.

use std::{
    io,
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    collaborators::MessageGateway,
    exchange::PeerId,
    protocol::messages::WireMessage,
};

/// A background timer, cancelled when dropped.
///
/// Dropping disconnects the cancel channel and joins the timer thread, so no task
/// runs after the owner is gone.
#[derive(Debug)]
pub struct Timer {
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    /// Run `task` every `interval` until dropped. The first run is one interval away.
    pub fn every<F>(name: String, interval: Duration, mut task: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let thread = thread::Builder::new().name(name).spawn(move || loop {
            match cancelled.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => task(),
                _ => break,
            }
        })?;
        Ok(Self {
            cancel: Some(cancel),
            thread: Some(thread),
        })
    }

    /// Run `task` once after `delay`, unless dropped before.
    pub fn once<F>(name: String, delay: Duration, task: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let thread = thread::Builder::new().name(name).spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(delay) {
                task()
            }
        })?;
        Ok(Self {
            cancel: Some(cancel),
            thread: Some(thread),
        })
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel.take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            let name = thread.thread().name().unwrap_or("unknown").to_string();
            if let Err(e) = thread.join() {
                log::error!("Error {:?} while joining timer {}", e, name);
            }
        }
    }
}

type ReplyFilter<T> = Box<dyn FnMut(&PeerId, &WireMessage) -> Option<T> + Send>;

/// Sends a message once immediately and again every interval, until a reply passes
/// the filter or the forwarder is dropped.
///
/// The matched reply is delivered once. Afterwards the forwarder is inert.
pub struct RetryForwarder<T> {
    to: PeerId,
    filter: ReplyFilter<T>,
    timer: Option<Timer>,
}

impl<T> RetryForwarder<T> {
    pub fn start<F>(
        gateway: Arc<dyn MessageGateway>,
        to: PeerId,
        message: WireMessage,
        interval: Duration,
        filter: F,
    ) -> io::Result<Self>
    where
        F: FnMut(&PeerId, &WireMessage) -> Option<T> + Send + 'static,
    {
        log::info!("[{}] ===> {} to {}", message.exchange_id(), message, to);
        send_logged(gateway.as_ref(), &to, message.clone());

        let name = format!("resend {} {}", message.exchange_id(), message);
        let destination = to.clone();
        let timer = Timer::every(name, interval, move || {
            log::debug!(
                "[{}] ===> {} to {} (resend)",
                message.exchange_id(),
                message,
                destination
            );
            send_logged(gateway.as_ref(), &destination, message.clone());
        })?;

        Ok(Self {
            to,
            filter: Box::new(filter),
            timer: Some(timer),
        })
    }

    pub fn destination(&self) -> &PeerId {
        &self.to
    }

    pub fn is_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Offer an inbound message. Returns the matched value and stops resending on the
    /// first acceptable reply.
    pub fn offer(&mut self, from: &PeerId, message: &WireMessage) -> Option<T> {
        if !self.is_active() {
            return None;
        }
        let matched = (self.filter)(from, message)?;
        self.timer.take();
        Some(matched)
    }
}

fn send_logged(gateway: &dyn MessageGateway, to: &PeerId, message: WireMessage) {
    // Resends cover lost messages, so a failed send is only logged.
    if let Err(e) = gateway.send(to, message) {
        log::warn!("Failed sending to {}: {}", to, e);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Mutex,
    };

    use super::*;
    use crate::{
        collaborators::EventSender,
        error::NetError,
        exchange::ExchangeId,
    };

    #[derive(Default)]
    struct CountingGateway {
        sent: Mutex<Vec<(PeerId, WireMessage)>>,
    }

    impl CountingGateway {
        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl MessageGateway for CountingGateway {
        fn send(&self, to: &PeerId, message: WireMessage) -> Result<(), NetError> {
            self.sent.lock().unwrap().push((to.clone(), message));
            Ok(())
        }

        fn subscribe(&self, _: &ExchangeId, _: EventSender) {}

        fn unsubscribe(&self, _: &ExchangeId) {}
    }

    fn ack() -> WireMessage {
        WireMessage::CommitmentNotificationAck {
            exchange_id: ExchangeId::new("exchange-1"),
        }
    }

    fn aborted(reason: &str) -> WireMessage {
        WireMessage::ExchangeAborted {
            exchange_id: ExchangeId::new("exchange-1"),
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_resends_until_reply_matches() {
        let gateway = Arc::new(CountingGateway::default());
        let broker = PeerId::new("broker");
        let mut forwarder = RetryForwarder::start(
            gateway.clone(),
            broker.clone(),
            ack(),
            Duration::from_millis(10),
            |_, message| match message {
                WireMessage::ExchangeAborted { reason, .. } if reason == "match" => {
                    Some(reason.clone())
                }
                _ => None,
            },
        )
        .unwrap();

        // Sent once right away.
        assert!(gateway.count() >= 1);
        thread::sleep(Duration::from_millis(100));
        assert!(gateway.count() >= 3);

        assert_eq!(forwarder.offer(&broker, &aborted("no match")), None);
        assert!(forwarder.is_active());
        assert_eq!(
            forwarder.offer(&broker, &aborted("match")),
            Some("match".to_string())
        );
        assert!(!forwarder.is_active());
        // Delivered once.
        assert_eq!(forwarder.offer(&broker, &aborted("match")), None);

        let stopped_at = gateway.count();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(gateway.count(), stopped_at);
    }

    #[test]
    fn test_drop_cancels_resubmission() {
        let gateway = Arc::new(CountingGateway::default());
        let forwarder = RetryForwarder::start(
            gateway.clone(),
            PeerId::new("seller"),
            ack(),
            Duration::from_millis(10),
            |_, _| Some(()),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(30));
        drop(forwarder);

        let stopped_at = gateway.count();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(gateway.count(), stopped_at);
    }

    #[test]
    fn test_one_shot_timer() {
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let timer = Timer::once("fires".to_string(), Duration::from_millis(10), move || {
            counter.fetch_add(1, Relaxed);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(60));
        drop(timer);
        assert_eq!(fired.load(Relaxed), 1);

        let counter = fired.clone();
        let timer = Timer::once("cancelled".to_string(), Duration::from_secs(60), move || {
            counter.fetch_add(1, Relaxed);
        })
        .unwrap();
        drop(timer);
        assert_eq!(fired.load(Relaxed), 1);
    }
}
