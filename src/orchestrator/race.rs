//! Per-run signal funnel. Every asynchronous source a run listens to is
//! forwarded into one channel as a `RunSignal` tagged with the run it
//! belongs to, so the driver can select over all of them and discard
//! anything that does not carry its own run id.

use super::messages::PreviewMessage;
use crate::sandbox::ServerReady;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    DevOutput(String),
    DevExit(i32),
    ServerReady(ServerReady),
    Preview(PreviewMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSignal {
    pub run_id: String,
    pub kind: SignalKind,
}

/// Owns the forwarding tasks for one run and aborts them when dropped.
pub struct SignalFunnel {
    run_id: String,
    tx: mpsc::UnboundedSender<RunSignal>,
    rx: mpsc::UnboundedReceiver<RunSignal>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalFunnel {
    pub fn new(run_id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            run_id: run_id.into(),
            tx,
            rx,
            tasks: Vec::new(),
        }
    }

    pub async fn recv(&mut self) -> Option<RunSignal> {
        self.rx.recv().await
    }

    /// Preview messages keep the run id they were posted with.
    pub fn forward_preview(&mut self, mut messages: broadcast::Receiver<PreviewMessage>) {
        let tx = self.tx.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => {
                        let signal = RunSignal {
                            run_id: message.run_id().to_string(),
                            kind: SignalKind::Preview(message),
                        };
                        if tx.send(signal).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "preview inbox lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn forward_dev_output(&mut self, mut output: mpsc::UnboundedReceiver<String>) {
        let tx = self.tx.clone();
        let run_id = self.run_id.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                let signal = RunSignal {
                    run_id: run_id.clone(),
                    kind: SignalKind::DevOutput(chunk),
                };
                if tx.send(signal).is_err() {
                    break;
                }
            }
        }));
    }

    pub fn forward_dev_exit(&mut self, exit: oneshot::Receiver<i32>) {
        let tx = self.tx.clone();
        let run_id = self.run_id.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Ok(code) = exit.await {
                let _ = tx.send(RunSignal {
                    run_id,
                    kind: SignalKind::DevExit(code),
                });
            }
        }));
    }

    /// Takes the ready channel of the dev process this run spawned, so an
    /// address announced by another run's process never reaches this funnel.
    pub fn forward_server_ready(&mut self, mut ready: mpsc::UnboundedReceiver<ServerReady>) {
        let tx = self.tx.clone();
        let run_id = self.run_id.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(server) = ready.recv().await {
                let signal = RunSignal {
                    run_id: run_id.clone(),
                    kind: SignalKind::ServerReady(server),
                };
                if tx.send(signal).is_err() {
                    break;
                }
            }
        }));
    }
}

impl Drop for SignalFunnel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SignalFunnel, SignalKind};
    use crate::orchestrator::messages::PreviewMessage;
    use crate::sandbox::ServerReady;
    use tokio::sync::{broadcast, mpsc, oneshot};

    #[tokio::test]
    async fn tags_host_signals_with_the_owning_run() {
        let mut funnel = SignalFunnel::new("run-a");
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        funnel.forward_server_ready(ready_rx);
        funnel.forward_dev_exit(exit_rx);

        ready_tx
            .send(ServerReady {
                port: 3000,
                url: "http://x".to_string(),
            })
            .expect("send");
        let signal = funnel.recv().await.expect("ready signal");
        assert_eq!(signal.run_id, "run-a");
        assert!(matches!(signal.kind, SignalKind::ServerReady(_)));

        exit_tx.send(1).expect("exit");
        let signal = funnel.recv().await.expect("exit signal");
        assert_eq!(signal.kind, SignalKind::DevExit(1));
    }

    #[tokio::test]
    async fn preview_messages_keep_their_own_run_id() {
        let mut funnel = SignalFunnel::new("run-b");
        let (tx, rx) = broadcast::channel(4);
        funnel.forward_preview(rx);
        tx.send(PreviewMessage::AppRendered {
            run_id: "run-a".to_string(),
        })
        .expect("send");
        assert_eq!(funnel.recv().await.expect("signal").run_id, "run-a");
    }
}
