//! Test doubles for the transport layer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{LinkError, LinkResult};
use crate::protocol::{Frame, Negotiated};
use crate::transport::{Connector, LinkTaskEnds, OpenRequest, TransportEvent, TransportLink};

#[derive(Default)]
struct MockState {
    opens: Vec<OpenRequest>,
    links: Vec<mpsc::Sender<TransportEvent>>,
    sent: Arc<Mutex<Vec<Frame>>>,
    failures: VecDeque<LinkError>,
}

/// Connector that records opens and sent frames and lets tests inject
/// transport events into the most recent link.
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    auto_handshake: bool,
    fail_writes: Arc<AtomicBool>,
}

impl MockConnector {
    /// Links complete the STOMP handshake as soon as they open.
    pub fn new() -> Self {
        MockConnector {
            state: Arc::new(Mutex::new(MockState::default())),
            auto_handshake: true,
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Links stay in the handshake until a test emits `Connected`.
    pub fn manual() -> Self {
        MockConnector {
            auto_handshake: false,
            ..Self::new()
        }
    }

    pub fn fail_next_open(&self, err: LinkError) {
        self.state.lock().unwrap().failures.push_back(err);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens.len()
    }

    pub fn last_request(&self) -> Option<OpenRequest> {
        self.state.lock().unwrap().opens.last().cloned()
    }

    /// Every frame written on any link, in write order.
    pub fn sent(&self) -> Vec<Frame> {
        self.state.lock().unwrap().sent.lock().unwrap().clone()
    }

    /// Sends `event` on the most recent link.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let tx = self.state.lock().unwrap().links.last().cloned();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, request: OpenRequest) -> LinkResult<TransportLink> {
        let mut state = self.state.lock().unwrap();
        state.opens.push(request);
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let (link, ends) = TransportLink::channel();
        let LinkTaskEnds {
            mut outgoing,
            events,
        } = ends;

        if self.auto_handshake {
            let _ = events.try_send(TransportEvent::Connected {
                heart_beat: Negotiated::default(),
                version: Some("1.2".into()),
            });
        }
        state.links.push(events);

        let sent = state.sent.clone();
        let fail = self.fail_writes.clone();
        tokio::spawn(async move {
            while let Some(out) = outgoing.recv().await {
                let result = if fail.load(Ordering::SeqCst) {
                    Err(LinkError::PublishFailed("mock write failure".into()))
                } else {
                    sent.lock().unwrap().push(out.frame);
                    Ok(())
                };
                if let Some(ack) = out.ack {
                    let _ = ack.send(result);
                }
            }
        });

        Ok(link)
    }
}

/// Lets spawned tasks run without advancing time.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
