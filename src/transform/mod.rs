use async_trait::async_trait;
use log::{error, info};

use crate::{
    config::TransformsConfig, message::DnsMessage, metrics::PIPELINE_ERRORS, worker::Route,
};

pub mod reducer;

pub use reducer::ReducerProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Drop,
}

#[async_trait]
pub trait Transform: Send {
    fn name(&self) -> &'static str;

    fn process(&mut self, dm: &mut DnsMessage) -> anyhow::Result<Verdict>;

    async fn reload(&mut self, config: &TransformsConfig);

    async fn stop(&mut self) {}
}

pub struct Transforms {
    name: String,
    config: TransformsConfig,
    outputs: Vec<Route>,
    chain: Vec<Box<dyn Transform>>,
}

impl Transforms {
    pub fn new(config: &TransformsConfig, outputs: Vec<Route>, name: &str) -> Self {
        let chain = build_chain(config, &outputs, name);
        Self {
            name: name.to_owned(),
            config: config.clone(),
            outputs,
            chain,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn process(&mut self, dm: &mut DnsMessage) -> Verdict {
        for transform in self.chain.iter_mut() {
            match transform.process(dm) {
                Ok(Verdict::Continue) => (),
                Ok(Verdict::Drop) => return Verdict::Drop,
                Err(err) => {
                    PIPELINE_ERRORS
                        .with_label_values(&[transform.name()])
                        .inc();
                    error!("[{}] {} transform failed: {:#}", self.name, transform.name(), err);
                }
            }
        }
        Verdict::Continue
    }

    pub async fn reload(&mut self, config: &TransformsConfig) {
        if *config == self.config {
            return;
        }
        if config.reducer.repetitive_traffic_detector
            != self.config.reducer.repetitive_traffic_detector
        {
            info!("[{}] rebuilding transforms", self.name);
            self.stop().await;
            self.chain = build_chain(config, &self.outputs, &self.name);
        } else {
            for transform in self.chain.iter_mut() {
                transform.reload(config).await;
            }
        }
        self.config = config.clone();
    }

    pub async fn stop(&mut self) {
        for transform in self.chain.iter_mut() {
            transform.stop().await;
        }
    }
}

fn build_chain(
    config: &TransformsConfig,
    outputs: &[Route],
    name: &str,
) -> Vec<Box<dyn Transform>> {
    let mut chain: Vec<Box<dyn Transform>> = Vec::new();
    if config.reducer.repetitive_traffic_detector {
        chain.push(Box::new(ReducerProcessor::new(
            &config.reducer,
            outputs.to_vec(),
            name,
        )));
    }
    chain
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::{Transform, Transforms, Verdict};
    use crate::{
        config::{ReducerConfig, TransformsConfig},
        message::DnsMessage,
    };

    struct Failing;

    #[async_trait]
    impl Transform for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn process(&mut self, _dm: &mut DnsMessage) -> anyhow::Result<Verdict> {
            anyhow::bail!("always fails")
        }

        async fn reload(&mut self, _config: &TransformsConfig) {}
    }

    #[tokio::test]
    async fn should_continue_after_transform_error() {
        let mut transforms = Transforms::new(&TransformsConfig::default(), Vec::new(), "test");
        transforms.chain.push(Box::new(Failing));

        assert_eq!(transforms.process(&mut DnsMessage::new()), Verdict::Continue);
    }

    #[tokio::test]
    async fn should_enable_reducer_on_reload() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut transforms = Transforms::new(&TransformsConfig::default(), vec![tx], "test");
        assert!(transforms.is_empty());

        let config = TransformsConfig {
            reducer: ReducerConfig {
                repetitive_traffic_detector: true,
                qname_plus_one: false,
                watch_interval: Duration::from_secs(60),
            },
        };
        transforms.reload(&config).await;

        assert!(!transforms.is_empty());
        assert_eq!(transforms.process(&mut DnsMessage::new()), Verdict::Drop);
        transforms.stop().await;
        let flushed = rx.recv().await.unwrap();
        assert_eq!(flushed.reducer.map(|r| r.occurrences), Some(1));
    }
}
