use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::context::SwarmContext;
use crate::constants::DEFAULT_ANNOUNCE_INTERVAL;
use crate::tracker::{AnnounceResponse, Tracker, TrackerError, TrackerEvent};

/// Result of one announce round over every URL.
#[derive(Debug)]
pub(crate) enum AnnounceRound {
    Peers(Vec<SocketAddr>),
    /// Every URL failed.
    Failed,
}

struct Endpoint {
    url: String,
    tracker: Option<Tracker>,
}

/// Re-announces for the lifetime of a download.
///
/// Starts with `started`, then follows the tracker's interval, backing off
/// exponentially while every URL fails. A message on `control` ends the
/// loop after one final, time-bounded announce carrying that event.
pub(crate) async fn announce_loop(
    ctx: Arc<SwarmContext>,
    urls: Vec<String>,
    rounds: mpsc::UnboundedSender<AnnounceRound>,
    mut control: mpsc::UnboundedReceiver<TrackerEvent>,
) {
    let mut endpoints: Vec<Endpoint> = urls
        .into_iter()
        .map(|url| Endpoint { url, tracker: None })
        .collect();
    let mut event = TrackerEvent::Started;
    let mut failures = 0u32;

    loop {
        let result = tokio::select! {
            result = announce_round(&ctx, &mut endpoints, event) => result,
            last = control.recv() => {
                final_announce(&ctx, &mut endpoints, last).await;
                return;
            }
        };

        let delay = match result {
            Ok(response) => {
                event = TrackerEvent::None;
                failures = 0;
                let peers: Vec<SocketAddr> = response.all_peers().copied().collect();
                let _ = rounds.send(AnnounceRound::Peers(peers));
                next_interval(&response)
            }
            Err(e) => {
                failures += 1;
                let _ = rounds.send(AnnounceRound::Failed);
                let delay = backoff(
                    ctx.config.announce_retry_base,
                    ctx.config.announce_retry_cap,
                    failures,
                );
                warn!("all trackers failed ({}), retrying in {:?}", e, delay);
                delay
            }
        };

        tokio::select! {
            _ = sleep(delay) => {}
            last = control.recv() => {
                final_announce(&ctx, &mut endpoints, last).await;
                return;
            }
        }
    }
}

async fn final_announce(
    ctx: &SwarmContext,
    endpoints: &mut [Endpoint],
    event: Option<TrackerEvent>,
) {
    let Some(event) = event else {
        return;
    };
    match timeout(
        ctx.config.final_announce_timeout,
        announce_round(ctx, endpoints, event),
    )
    .await
    {
        Ok(Ok(_)) => debug!("final announce ({:?}) delivered", event),
        Ok(Err(e)) => debug!("final announce ({:?}) failed: {}", event, e),
        Err(_) => debug!("final announce ({:?}) timed out", event),
    }
}

/// Walks the URLs in order; the first success wins.
async fn announce_round(
    ctx: &SwarmContext,
    endpoints: &mut [Endpoint],
    event: TrackerEvent,
) -> Result<AnnounceResponse, TrackerError> {
    let mut last_error = TrackerError::Unreachable("no announce urls".into());

    for endpoint in endpoints.iter_mut() {
        if endpoint.tracker.is_none() {
            match Tracker::with_udp_retry(
                &endpoint.url,
                ctx.config.udp_retry_base,
                ctx.config.udp_max_attempts,
            )
            .await
            {
                Ok(tracker) => endpoint.tracker = Some(tracker),
                Err(e) => {
                    debug!("{}: {}", endpoint.url, e);
                    last_error = e;
                    continue;
                }
            }
        }
        let Some(tracker) = endpoint.tracker.as_mut() else {
            continue;
        };

        let stats = ctx.announce_stats();
        match tracker
            .announce(
                &ctx.descriptor,
                &ctx.config.peer_id,
                ctx.config.listen_port,
                stats,
                event,
            )
            .await
        {
            Ok(response) => {
                info!(
                    "{}: {} peers (interval {}s)",
                    endpoint.url,
                    response.peers.len() + response.peers6.len(),
                    response.interval
                );
                return Ok(response);
            }
            Err(e) => {
                warn!("{}: announce failed: {}", endpoint.url, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

fn next_interval(response: &AnnounceResponse) -> Duration {
    let secs = response.interval.max(response.min_interval.unwrap_or(0));
    if secs == 0 {
        DEFAULT_ANNOUNCE_INTERVAL
    } else {
        Duration::from_secs(secs as u64)
    }
}

/// `base * 2^(failures - 1)`, capped.
fn backoff(base: Duration, cap: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(cap)
}
