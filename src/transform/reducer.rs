use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use log::{debug, error};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

use super::{Transform, Verdict};
use crate::{
    config::{ReducerConfig, TransformsConfig},
    message::{DnsMessage, ReducerInfo},
    router::BestEffort,
    worker::Route,
};

#[derive(Debug)]
struct ExpiryEntry {
    key: String,
    expires_at: Instant,
}

/// Keyed store plus an expiry queue ordered by first insertion. Hits on a
/// known key never move its entry, so the first expiry wins.
pub struct MapTraffic {
    kv: DashMap<String, DnsMessage>,
    expiry: Mutex<VecDeque<ExpiryEntry>>,
    ttl: Duration,
    get_time: fn() -> Instant,
}

impl MapTraffic {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Instant::now)
    }

    fn with_clock(ttl: Duration, get_time: fn() -> Instant) -> Self {
        Self {
            kv: DashMap::new(),
            expiry: Mutex::new(VecDeque::new()),
            ttl,
            get_time,
        }
    }

    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }

    pub fn set(&self, key: String, mut dm: DnsMessage) {
        // held across the store update so a hit never races a flush
        let mut expiry = self.lock_expiry();
        match self.kv.entry(key) {
            Entry::Occupied(mut stored) => {
                let reducer = stored.get_mut().reducer.get_or_insert_with(ReducerInfo::default);
                reducer.occurrences += 1;
                reducer.cumulative_length += dm.dns.length;
            }
            Entry::Vacant(vacant) => {
                let key = vacant.key().clone();
                dm.reducer = Some(ReducerInfo {
                    occurrences: 1,
                    cumulative_length: dm.dns.length,
                });
                vacant.insert(dm);
                expiry.push_back(ExpiryEntry {
                    key,
                    expires_at: (self.get_time)() + self.ttl,
                });
            }
        }
    }

    pub fn process_expired_keys(&self) -> Vec<DnsMessage> {
        let now = (self.get_time)();
        let mut expiry = self.lock_expiry();
        let mut expired = Vec::new();
        while expiry.front().is_some_and(|entry| entry.expires_at <= now) {
            if let Some(entry) = expiry.pop_front() {
                if let Some((_, dm)) = self.kv.remove(&entry.key) {
                    expired.push(dm);
                }
            }
        }
        expired
    }

    pub fn drain(&self) -> Vec<DnsMessage> {
        let mut expiry = self.lock_expiry();
        expiry
            .drain(..)
            .filter_map(|entry| self.kv.remove(&entry.key).map(|(_, dm)| dm))
            .collect()
    }

    fn lock_expiry(&self) -> MutexGuard<'_, VecDeque<ExpiryEntry>> {
        self.expiry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ReducerProcessor {
    name: String,
    qname_plus_one: bool,
    watch_interval: Duration,
    outputs: Vec<Route>,
    store: Arc<MapTraffic>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReducerProcessor {
    pub fn new(config: &ReducerConfig, outputs: Vec<Route>, name: &str) -> Self {
        let mut processor = Self {
            name: name.to_owned(),
            qname_plus_one: config.qname_plus_one,
            watch_interval: config.watch_interval,
            outputs,
            store: Arc::new(MapTraffic::new(config.watch_interval)),
            stop: CancellationToken::new(),
            task: None,
        };
        processor.start();
        processor
    }

    fn start(&mut self) {
        self.store = Arc::new(MapTraffic::new(self.watch_interval));
        self.stop = CancellationToken::new();
        self.task = Some(tokio::spawn(run(
            self.name.clone(),
            self.store.clone(),
            self.outputs.clone(),
            self.watch_interval,
            self.stop.clone(),
        )));
    }

    pub fn key(&self, dm: &DnsMessage) -> String {
        let qname = self.qname(dm);
        [
            dm.dnstap.identity.as_str(),
            dm.dnstap.operation.as_str(),
            &dm.network.query_ip(),
            &qname,
            dm.dns.qtype.as_str(),
        ]
        .join("|")
    }

    fn qname(&self, dm: &DnsMessage) -> String {
        if self.qname_plus_one {
            etld_plus_one(&dm.dns.qname)
        } else {
            dm.dns.qname.clone()
        }
    }
}

#[async_trait]
impl Transform for ReducerProcessor {
    fn name(&self) -> &'static str {
        "reducer"
    }

    fn process(&mut self, dm: &mut DnsMessage) -> anyhow::Result<Verdict> {
        let key = self.key(dm);
        let mut stored = dm.clone();
        stored.dns.qname = self.qname(dm);
        self.store.set(key, stored);
        Ok(Verdict::Drop)
    }

    async fn reload(&mut self, config: &TransformsConfig) {
        self.qname_plus_one = config.reducer.qname_plus_one;
        if config.reducer.watch_interval != self.watch_interval {
            self.stop().await;
            self.watch_interval = config.reducer.watch_interval;
            self.start();
        }
    }

    async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!("[{}] reducer flush loop failed: {}", self.name, err);
            }
        }
    }
}

fn etld_plus_one(qname: &str) -> String {
    let qname = qname.trim_end_matches('.').to_lowercase();
    match psl::domain_str(&qname) {
        Some(domain) => domain.to_owned(),
        None => qname,
    }
}

async fn run(
    name: String,
    store: Arc<MapTraffic>,
    outputs: Vec<Route>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut best_effort = BestEffort::new(&name);
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let expired = store.process_expired_keys();
                debug!("[{}] reducer flushing {} message(s)", name, expired.len());
                for dm in expired {
                    best_effort.deliver(&outputs, dm);
                }
                best_effort.report();
            }
        }
    }
    for dm in store.drain() {
        best_effort.deliver(&outputs, dm);
    }
    best_effort.report();
}
