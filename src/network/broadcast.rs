use crate::error::Result;
use crate::network::dispatcher::Message;
use crate::network::overlay::Overlay;
use crate::network::peer::PeerIdentity;
use log::{debug, error};

/// Result of pushing one object to one peer.
#[derive(Debug)]
pub struct Delivery {
    pub peer: PeerIdentity,
    pub outcome: Result<()>,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        self.outcome.is_ok()
    }
}

impl Overlay {
    /// Best-effort push of `object` to every known peer. A failing peer is
    /// logged and skipped; only a local encode failure aborts the round.
    pub fn broadcast<M: Message>(&self, object: &M) -> Result<Vec<Delivery>> {
        let payload = object.to_bytes()?;
        let peers = self.peers();
        let outcomes = self.send_to_all(&peers, M::KIND, &payload);

        let deliveries = peers
            .into_iter()
            .zip(outcomes)
            .map(|(peer, outcome)| {
                match &outcome {
                    Ok(()) => debug!("Sent {} to {peer}", M::KIND),
                    Err(e) => error!(
                        "failed to send object to {}({}). Skipping... [error: {e}]",
                        peer.address, peer.id
                    ),
                }
                Delivery { peer, outcome }
            })
            .collect();

        Ok(deliveries)
    }
}
