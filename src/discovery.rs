use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::distributed::DistributedError;

/// Cluster-membership changes the serving layer reacts to. Implemented by
/// the distributed log; driven by whatever produces membership events
/// (a gossip layer, an operator API, a test).
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn join(&self, name: &str, addr: &str) -> Result<(), DistributedError>;
    async fn leave(&self, name: &str) -> Result<(), DistributedError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Join { name: String, addr: String },
    Leave { name: String },
}

/// Drains membership events into the handler until the channel closes.
///
/// Every node observes every event but only the leader can act on them, so
/// not-leader failures are routine and logged at debug; anything else is a
/// real fault.
pub fn spawn_event_pump(
    handler: Arc<dyn Handler>,
    mut events: mpsc::Receiver<MemberEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let result = match &event {
                MemberEvent::Join { name, addr } => handler.join(name, addr).await,
                MemberEvent::Leave { name } => handler.leave(name).await,
            };
            match result {
                Ok(()) => {}
                Err(DistributedError::NotLeader) => {
                    debug!(?event, "membership change ignored on non-leader")
                }
                Err(e) => error!(?event, error = %e, "membership change failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<String>>,
        not_leader: bool,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn join(&self, name: &str, addr: &str) -> Result<(), DistributedError> {
            self.calls.lock().unwrap().push(format!("join {name} {addr}"));
            if self.not_leader {
                return Err(DistributedError::NotLeader);
            }
            Ok(())
        }

        async fn leave(&self, name: &str) -> Result<(), DistributedError> {
            self.calls.lock().unwrap().push(format!("leave {name}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn pump_invokes_handler_in_order() {
        let handler = Arc::new(RecordingHandler::default());
        let (tx, rx) = mpsc::channel(4);
        let pump = spawn_event_pump(handler.clone(), rx);

        tx.send(MemberEvent::Join {
            name: "1".to_string(),
            addr: "127.0.0.1:9001".to_string(),
        })
        .await
        .unwrap();
        tx.send(MemberEvent::Leave {
            name: "1".to_string(),
        })
        .await
        .unwrap();
        drop(tx);
        pump.await.unwrap();

        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["join 1 127.0.0.1:9001", "leave 1"]);
    }

    #[tokio::test]
    async fn pump_survives_not_leader_errors() {
        let handler = Arc::new(RecordingHandler {
            not_leader: true,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(4);
        let pump = spawn_event_pump(handler.clone(), rx);

        for name in ["1", "2"] {
            tx.send(MemberEvent::Join {
                name: name.to_string(),
                addr: format!("127.0.0.1:900{name}"),
            })
            .await
            .unwrap();
        }
        drop(tx);
        pump.await.unwrap();

        assert_eq!(handler.calls.lock().unwrap().len(), 2);
    }
}
