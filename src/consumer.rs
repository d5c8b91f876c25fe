use std::io::{self, Write};

use anyhow::Result;
use log::error;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    config::{ConsumerConfig, Validate},
    message::DnsMessage,
    transform::{Transforms, Verdict},
    worker::{Route, WorkerHandle, WorkerState},
};

pub struct LogConsumer;

impl LogConsumer {
    pub fn start(
        name: &str,
        config: ConsumerConfig,
    ) -> Result<(Route, WorkerHandle<ConsumerConfig>)> {
        Self::start_with_writer(name, config, Box::new(io::stdout()))
    }

    pub fn start_with_writer(
        name: &str,
        config: ConsumerConfig,
        writer: Box<dyn Write + Send>,
    ) -> Result<(Route, WorkerHandle<ConsumerConfig>)> {
        config.validate()?;
        let (input_tx, input_rx) = mpsc::channel(config.buffer_size());
        let (printer_tx, printer_rx) = mpsc::channel(config.buffer_size());
        let printer = tokio::spawn(print_lines(name.to_owned(), printer_rx, writer));
        let handle = WorkerHandle::spawn(name, config, Vec::new(), move |state| {
            control_loop(state, input_rx, printer_tx, printer)
        });
        Ok((input_tx, handle))
    }
}

async fn control_loop(
    mut state: WorkerState<ConsumerConfig>,
    mut input: mpsc::Receiver<DnsMessage>,
    printer: Route,
    printer_task: JoinHandle<()>,
) {
    let name = state.name().to_owned();
    let stop = state.stop_token();
    let mut transforms = Transforms::new(&state.config().transforms, vec![printer.clone()], &name);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(update) = state.next_config() => {
                if state.apply_config(update) {
                    transforms.reload(&state.config().transforms).await;
                }
            }
            dm = input.recv() => match dm {
                Some(dm) => handle(&mut transforms, &printer, dm).await,
                None => break,
            },
        }
    }
    input.close();
    while let Some(dm) = input.recv().await {
        handle(&mut transforms, &printer, dm).await;
    }
    transforms.stop().await;
    drop(transforms);
    drop(printer);
    if let Err(err) = printer_task.await {
        error!("[{}] printer failed: {}", name, err);
    }
}

async fn handle(transforms: &mut Transforms, printer: &Route, mut dm: DnsMessage) {
    if transforms.process(&mut dm) == Verdict::Continue {
        let _ = printer.send(dm).await;
    }
}

async fn print_lines(
    name: String,
    mut input: mpsc::Receiver<DnsMessage>,
    mut writer: Box<dyn Write + Send>,
) {
    while let Some(dm) = input.recv().await {
        if let Err(err) = writeln!(writer, "{}", dm) {
            error!("[{}] unable to write message: {}", name, err);
        }
    }
    let _ = writer.flush();
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Write},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::LogConsumer;
    use crate::{
        config::{ConsumerConfig, ReducerConfig, TransformsConfig},
        message::DnsMessage,
    };

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    fn message(qname: &str) -> DnsMessage {
        let mut dm = DnsMessage::new();
        dm.dns.qname = qname.to_owned();
        dm.dns.length = 30;
        dm
    }

    #[tokio::test]
    async fn should_print_one_line_per_message() -> Result<()> {
        let buffer = Buffer::default();
        let (route, handle) = LogConsumer::start_with_writer(
            "stdout",
            ConsumerConfig::default(),
            Box::new(buffer.clone()),
        )?;

        route.send(message("a.example.com")).await?;
        route.send(message("b.example.com")).await?;
        handle.stop().await;

        let lines = buffer.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("a.example.com"));
        assert!(lines[1].contains("b.example.com"));
        Ok(())
    }

    #[tokio::test]
    async fn should_print_reduced_messages() -> Result<()> {
        let buffer = Buffer::default();
        let config = ConsumerConfig {
            channel_buffer_size: None,
            transforms: TransformsConfig {
                reducer: ReducerConfig {
                    repetitive_traffic_detector: true,
                    qname_plus_one: false,
                    watch_interval: Duration::from_secs(3600),
                },
            },
        };
        let (route, handle) =
            LogConsumer::start_with_writer("stdout", config, Box::new(buffer.clone()))?;

        for _ in 0..3 {
            route.send(message("example.com")).await?;
        }
        handle.stop().await;

        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("occurrences=3 cumulative_length=90"), "{}", lines[0]);
        Ok(())
    }
}
