//! Routes inbound discovery requests to the owning overlay.

use std::collections::HashMap;
use std::sync::Arc;

use cairn_overlay::OverlayProtocol;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::transport::{InboundRequest, UdpTransport};

/// Maps sub-protocol tags to overlays and dispatches inbound requests.
pub struct Dispatcher {
    overlays: HashMap<[u8; 2], Arc<OverlayProtocol>>,
    transport: UdpTransport,
}

impl Dispatcher {
    pub fn new(transport: UdpTransport) -> Dispatcher {
        Dispatcher {
            overlays: HashMap::new(),
            transport,
        }
    }

    pub fn register(&mut self, overlay: Arc<OverlayProtocol>) {
        self.overlays
            .insert(overlay.protocol_id().tag(), overlay);
    }

    /// Consume inbound requests until shutdown. Each request is handled
    /// on its own task so a slow handler never blocks the queue.
    pub fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<InboundRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!("dispatcher shutting down");
                        return;
                    }
                    request = requests.recv() => {
                        let Some(request) = request else {
                            tracing::info!("request queue closed, dispatcher exiting");
                            return;
                        };
                        self.dispatch(request);
                    }
                }
            }
        })
    }

    fn dispatch(&self, request: InboundRequest) {
        let Some(overlay) = self.overlays.get(&request.protocol) else {
            tracing::trace!(
                protocol = hex::encode(request.protocol),
                "request for unsupported sub-protocol"
            );
            return;
        };
        let overlay = Arc::clone(overlay);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let response = overlay
                .handle_talk_request(request.enr, &request.payload)
                .await;
            if let Some(payload) = response {
                transport.respond(request.from, request.nonce, payload).await;
            }
        });
    }
}
