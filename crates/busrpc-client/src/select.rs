//! Picking one server among the claims for a request.
//!
//! The selector collects [`ClaimRequest`]s for one request id during the
//! affinity window. Depending on the [`SelectionConfig`] it takes the first
//! eligible claim, a claim at or above the maximum affinity, or the best
//! claim seen when the short-circuit timer or the window runs out.

use busrpc_core::config::SelectionConfig;
use busrpc_core::error::{ErrorCode, RpcError, RpcResult};
use busrpc_core::time::deadline_after;
use busrpc_core::wire::ClaimRequest;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::debug;

fn eligible(selection: &SelectionConfig, affinity: f32, best: f32) -> bool {
    if selection.minimum_affinity > 0.0 && affinity < selection.minimum_affinity {
        return false;
    }
    affinity > best
}

async fn maybe_sleep(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Choose the server that should execute a request.
///
/// `deadline` is the request's overall deadline; the affinity window never
/// outlives it.
///
/// # Errors
///
/// [`RpcError::NoResponse`] if no server claimed the request,
/// an `Unavailable` status if claims arrived but none was eligible, and
/// [`RpcError::RequestTimeout`] if the deadline passed first.
pub async fn select_server(
    claims: &mut mpsc::Receiver<ClaimRequest>,
    selection: &SelectionConfig,
    deadline: Instant,
) -> RpcResult<String> {
    let window = sleep_until(deadline_after(selection.affinity_timeout()));
    tokio::pin!(window);
    let expired = sleep_until(deadline);
    tokio::pin!(expired);

    let mut short_circuit: Option<Pin<Box<Sleep>>> = None;
    let mut shorted = false;
    let mut winner: Option<String> = None;
    let mut best = 0.0_f32;
    let mut received = 0usize;

    loop {
        tokio::select! {
            _ = &mut expired => return Err(RpcError::RequestTimeout),

            _ = &mut window => {
                return match winner {
                    Some(server_id) => Ok(server_id),
                    None if received > 0 => Err(RpcError::new(
                        ErrorCode::Unavailable,
                        format!("no servers available (received {received} claims)"),
                    )),
                    None => Err(RpcError::NoResponse),
                };
            }

            _ = maybe_sleep(&mut short_circuit), if !shorted => {
                shorted = true;
                if let Some(server_id) = winner.take() {
                    return Ok(server_id);
                }
            }

            claim = claims.recv() => {
                let Some(claim) = claim else {
                    return Err(RpcError::Canceled);
                };
                received += 1;
                if !eligible(selection, claim.affinity, best) {
                    debug!(server_id = %claim.server_id, affinity = claim.affinity, "claim not eligible");
                    continue;
                }

                let at_max = selection.maximum_affinity > 0.0 && claim.affinity >= selection.maximum_affinity;
                if selection.accept_first_available || at_max || shorted {
                    return Ok(claim.server_id);
                }

                if short_circuit.is_none() {
                    if let Some(delay) = selection.short_circuit_timeout() {
                        short_circuit = Some(Box::pin(tokio::time::sleep(delay)));
                    }
                }
                best = claim.affinity;
                winner = Some(claim.server_id);
            }
        }
    }
}
