use log::warn;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{message::DnsMessage, metrics::DROPPED_EVENTS, worker::Route};

pub async fn deliver(routes: &[Route], dm: DnsMessage) {
    let Some((last, rest)) = routes.split_last() else {
        return;
    };
    for route in rest {
        if route.send(dm.clone()).await.is_err() {
            warn!("route closed, message discarded");
        }
    }
    if last.send(dm).await.is_err() {
        warn!("route closed, message discarded");
    }
}

pub struct BestEffort {
    worker: String,
    dropped: u64,
}

impl BestEffort {
    pub fn new(worker: &str) -> Self {
        Self {
            worker: worker.to_owned(),
            dropped: 0,
        }
    }

    pub fn deliver(&mut self, routes: &[Route], dm: DnsMessage) {
        let Some((last, rest)) = routes.split_last() else {
            return;
        };
        for route in rest {
            self.try_send(route, dm.clone());
        }
        self.try_send(last, dm);
    }

    fn try_send(&mut self, route: &Route, dm: DnsMessage) {
        if route.try_send(dm).is_err() {
            self.count_drop();
        }
    }

    pub fn offer<T>(&mut self, output: &mpsc::Sender<T>, item: T) -> bool {
        match output.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.count_drop();
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn count_drop(&mut self) {
        self.dropped += 1;
        DROPPED_EVENTS.with_label_values(&[&self.worker]).inc();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn report(&mut self) -> u64 {
        let dropped = std::mem::take(&mut self.dropped);
        if dropped > 0 {
            warn!(
                "[{}] {} event(s) dropped, output channel full",
                self.worker, dropped
            );
        }
        dropped
    }
}
