use std::{future::Future, sync::Arc};

use arc_swap::ArcSwap;
use log::{error, info};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigError, Validate},
    message::DnsMessage,
};

pub type Route = mpsc::Sender<DnsMessage>;

pub type ConfigUpdate<C> = (C, oneshot::Sender<Result<(), ConfigError>>);

pub struct WorkerState<C> {
    name: Arc<str>,
    stop: CancellationToken,
    config: Arc<ArcSwap<C>>,
    updates: mpsc::Receiver<ConfigUpdate<C>>,
    routes: Arc<ArcSwap<Vec<Route>>>,
}

impl<C> WorkerState<C>
where
    C: Validate + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> Arc<C> {
        self.config.load_full()
    }

    pub fn shared_config(&self) -> Arc<ArcSwap<C>> {
        self.config.clone()
    }

    /// Snapshot of the current routes; later swaps do not affect it.
    pub fn routes(&self) -> Arc<Vec<Route>> {
        self.routes.load_full()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub async fn next_config(&mut self) -> Option<ConfigUpdate<C>> {
        self.updates.recv().await
    }

    pub fn apply_config(&self, (config, ack): ConfigUpdate<C>) -> bool {
        let result = config.validate();
        match &result {
            Ok(()) => {
                self.config.store(Arc::new(config));
                info!("[{}] configuration reloaded", self.name);
            }
            Err(err) => {
                error!(
                    "[{}] invalid configuration, keeping the active one: {}",
                    self.name, err
                );
            }
        }
        let applied = result.is_ok();
        let _ = ack.send(result);
        applied
    }
}

pub struct WorkerHandle<C> {
    name: Arc<str>,
    stop: CancellationToken,
    config: Arc<ArcSwap<C>>,
    updates: mpsc::Sender<ConfigUpdate<C>>,
    routes: Arc<ArcSwap<Vec<Route>>>,
    done: JoinHandle<()>,
}

impl<C> WorkerHandle<C>
where
    C: Validate + Send + Sync + 'static,
{
    pub fn spawn<F, Fut>(name: &str, config: C, routes: Vec<Route>, run: F) -> Self
    where
        F: FnOnce(WorkerState<C>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name);
        let stop = CancellationToken::new();
        let config = Arc::new(ArcSwap::from_pointee(config));
        let routes = Arc::new(ArcSwap::from_pointee(routes));
        let (updates_tx, updates_rx) = mpsc::channel(1);
        let state = WorkerState {
            name: name.clone(),
            stop: stop.clone(),
            config: config.clone(),
            updates: updates_rx,
            routes: routes.clone(),
        };
        let done = tokio::spawn(run(state));
        Self {
            name,
            stop,
            config,
            updates: updates_tx,
            routes,
            done,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> Arc<C> {
        self.config.load_full()
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_finished()
    }

    pub async fn reload(&self, config: C) -> Result<(), ConfigError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.updates
            .send((config, ack_tx))
            .await
            .map_err(|_| ConfigError::WorkerStopped(self.name.to_string()))?;
        ack_rx
            .await
            .map_err(|_| ConfigError::WorkerStopped(self.name.to_string()))?
    }

    pub fn set_routes(&self, routes: Vec<Route>) {
        self.routes.store(Arc::new(routes));
    }

    pub async fn stop(self) {
        info!("[{}] stopping...", self.name);
        self.stop.cancel();
        if let Err(err) = self.done.await {
            error!("[{}] control loop failed: {}", self.name, err);
        }
        info!("[{}] stopped", self.name);
    }
}
