//! Server side of the claim race.
//!
//! A server that wants to execute a request publishes a [`ClaimRequest`] to
//! the caller and parks on a one-shot slot keyed by request id. The handler's
//! receive loop fills the slot when the caller's [`ClaimResponse`] arrives on
//! the shared claim-response subscription. The slot is removed when the race
//! ends, whatever the outcome, so a late or duplicated response finds nothing
//! to deliver to.
//!
//! At most one race runs per request id. A request delivered twice while its
//! race is pending is dropped, so a won request still executes exactly once.

use busrpc_core::bus::{self, MessageBus};
use busrpc_core::error::RpcResult;
use busrpc_core::time::remaining;
use busrpc_core::wire::{ClaimRequest, ClaimResponse};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Pending claim races of one handler, keyed by request id.
#[derive(Debug, Default)]
pub(crate) struct ClaimTable {
    pending: Mutex<HashMap<String, (u64, oneshot::Sender<String>)>>,
    generation: AtomicU64,
}

impl ClaimTable {
    /// Open a slot for `request_id`, or `None` if a race for it is already
    /// pending.
    fn insert(&self, request_id: &str) -> Option<(u64, oneshot::Receiver<String>)> {
        match self.pending.lock().entry(request_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                slot.insert((generation, tx));
                Some((generation, rx))
            }
        }
    }

    /// Remove the slot of `request_id` if it still belongs to `generation`.
    fn remove(&self, request_id: &str, generation: u64) {
        let mut pending = self.pending.lock();
        if matches!(pending.get(request_id), Some((current, _)) if *current == generation) {
            pending.remove(request_id);
        }
    }

    /// Hand a claim response to the race waiting on it. Returns false when
    /// no race is waiting (already resolved, timed out or never ours).
    pub(crate) fn deliver(&self, response: ClaimResponse) -> bool {
        let slot = self.pending.lock().remove(&response.request_id);
        match slot {
            Some((_, tx)) => tx.send(response.server_id).is_ok(),
            None => {
                trace!(request_id = %response.request_id, "claim response without a pending race");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Removes a race's slot when dropped.
struct Slot<'a> {
    table: &'a ClaimTable,
    request_id: &'a str,
    generation: u64,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.table.remove(self.request_id, self.generation);
    }
}

/// One server's bid for one request.
pub(crate) struct Claim<'a> {
    pub request_id: &'a str,
    pub server_id: &'a str,
    pub affinity: f32,
    /// Absolute deadline of the request, nanoseconds since the epoch.
    pub expiry: i64,
    /// Channel the caller collects claims on.
    pub channel: &'a str,
}

/// Publish a claim and wait for the verdict.
///
/// Returns `Ok(true)` only if the caller named this server. Losing, timing
/// out, cancellation and a race already pending for the same request id all
/// return `Ok(false)`; a duplicate publishes nothing.
///
/// # Errors
///
/// Only a failed publish of the claim.
pub(crate) async fn claim_request(
    bus: &dyn MessageBus,
    table: &ClaimTable,
    claim: Claim<'_>,
    cancel: &CancellationToken,
) -> RpcResult<bool> {
    let Some((generation, rx)) = table.insert(claim.request_id) else {
        debug!(request_id = claim.request_id, "claim race already pending, duplicate dropped");
        return Ok(false);
    };
    let _slot = Slot {
        table,
        request_id: claim.request_id,
        generation,
    };

    bus::publish(
        bus,
        claim.channel,
        &ClaimRequest {
            request_id: claim.request_id.to_string(),
            server_id: claim.server_id.to_string(),
            affinity: claim.affinity,
        },
    )
    .await?;

    let won = tokio::select! {
        verdict = rx => matches!(verdict, Ok(winner) if winner == claim.server_id),
        _ = tokio::time::sleep(remaining(claim.expiry)) => false,
        _ = cancel.cancelled() => false,
    };
    debug!(request_id = claim.request_id, affinity = claim.affinity, won, "claim race finished");
    Ok(won)
}

#[cfg(test)]
mod tests {
    use super::*;
    use busrpc_core::bus::InMemoryBus;
    use busrpc_core::time::expiry_after;
    use std::sync::Arc;
    use std::time::Duration;

    fn response(request_id: &str, server_id: &str) -> ClaimResponse {
        ClaimResponse {
            request_id: request_id.into(),
            server_id: server_id.into(),
        }
    }

    #[tokio::test]
    async fn test_claim_won_and_duplicate_ignored() {
        let bus = InMemoryBus::new();
        let mut claims = bus::subscribe::<ClaimRequest>(&bus, "Svc|CLI_1|CLAIM", 4)
            .await
            .unwrap();
        let table = Arc::new(ClaimTable::default());

        let race = {
            let bus = bus.clone();
            let table = table.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                claim_request(
                    &bus,
                    &table,
                    Claim {
                        request_id: "REQ_1",
                        server_id: "SRV_a",
                        affinity: 0.7,
                        expiry: expiry_after(Duration::from_secs(1)),
                        channel: "Svc|CLI_1|CLAIM",
                    },
                    &cancel,
                )
                .await
            })
        };

        let claim = claims.recv().await.unwrap();
        assert_eq!(claim.server_id, "SRV_a");
        assert_eq!(claim.affinity, 0.7);

        assert!(table.deliver(response("REQ_1", "SRV_a")));
        assert!(!table.deliver(response("REQ_1", "SRV_a")));
        assert!(race.await.unwrap().unwrap());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_claim_lost_to_other_server() {
        let bus = InMemoryBus::new();
        let table = Arc::new(ClaimTable::default());
        let cancel = CancellationToken::new();

        let deliver = {
            let table = table.clone();
            async move {
                while !table.deliver(response("REQ_2", "SRV_other")) {
                    tokio::task::yield_now().await;
                }
            }
        };
        let race = claim_request(
            &bus,
            &table,
            Claim {
                request_id: "REQ_2",
                server_id: "SRV_a",
                affinity: 1.0,
                expiry: expiry_after(Duration::from_secs(1)),
                channel: "Svc|CLI_1|CLAIM",
            },
            &cancel,
        );
        let (won, ()) = tokio::join!(race, deliver);
        assert!(!won.unwrap());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_claim_times_out_at_expiry() {
        let bus = InMemoryBus::new();
        let table = ClaimTable::default();
        let cancel = CancellationToken::new();

        let won = claim_request(
            &bus,
            &table,
            Claim {
                request_id: "REQ_3",
                server_id: "SRV_a",
                affinity: 1.0,
                expiry: expiry_after(Duration::from_millis(30)),
                channel: "Svc|CLI_1|CLAIM",
            },
            &cancel,
        )
        .await
        .unwrap();
        assert!(!won);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_race_leaves_first_intact() {
        let bus = InMemoryBus::new();
        let mut claims = bus::subscribe::<ClaimRequest>(&bus, "Svc|CLI_1|CLAIM", 4)
            .await
            .unwrap();
        let table = Arc::new(ClaimTable::default());
        let claim = |expiry| Claim {
            request_id: "REQ_4",
            server_id: "SRV_a",
            affinity: 1.0,
            expiry,
            channel: "Svc|CLI_1|CLAIM",
        };

        let first = {
            let bus = bus.clone();
            let table = table.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                claim_request(&bus, &table, claim(expiry_after(Duration::from_secs(1))), &cancel).await
            })
        };
        claims.recv().await.unwrap();

        let cancel = CancellationToken::new();
        let second = claim_request(&bus, &table, claim(expiry_after(Duration::from_secs(1))), &cancel)
            .await
            .unwrap();
        assert!(!second);
        assert_eq!(table.len(), 1);

        assert!(table.deliver(response("REQ_4", "SRV_a")));
        assert!(first.await.unwrap().unwrap());
        assert_eq!(table.len(), 0);
        assert!(tokio::time::timeout(Duration::from_millis(50), claims.recv()).await.is_err());
    }

    #[test]
    fn test_stale_slot_does_not_remove_newer_race() {
        let table = ClaimTable::default();
        let (old, _rx) = table.insert("REQ_5").unwrap();
        assert!(table.deliver(response("REQ_5", "SRV_a")));

        let (_new, _rx2) = table.insert("REQ_5").unwrap();
        table.remove("REQ_5", old);
        assert_eq!(table.len(), 1);
    }
}
