//! Dead-letter monitor: poison messages must never pile up unseen.

use std::path::PathBuf;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::mq::QueueConsumer;

pub struct DlqMonitor {
    alarm_log: PathBuf,
}

impl DlqMonitor {
    pub fn new(alarm_log: impl Into<PathBuf>) -> Self {
        Self { alarm_log: alarm_log.into() }
    }

    pub async fn run(&self, consumer: QueueConsumer, mut shutdown: watch::Receiver<bool>) {
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.alarm_log)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                error!(path = %self.alarm_log.display(), error = %e, "cannot open dlq alarm log");
                return;
            }
        };
        info!(path = %self.alarm_log.display(), "dlq monitor started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { break };
                    let line = format!(
                        "[{}] ALARM: dead letter received | message_id={} | body={}\n",
                        Utc::now().format("%Y-%m-%d %H:%M:%S"),
                        delivery.message_id(),
                        String::from_utf8_lossy(&delivery.envelope.body),
                    );
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        error!(error = %e, "dlq alarm log write failed");
                    }
                    warn!(message_id = delivery.message_id(), "dead letter received");
                    delivery.ack();
                }
            }
        }
        let _ = file.flush().await;
        info!("dlq monitor stopped");
    }
}
