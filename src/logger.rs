use tracing::debug;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::config::Config;

#[cfg(debug_assertions)]
const DEFAULT_DIRECTIVE: &str = "tutor_rtc=debug";
#[cfg(not(debug_assertions))]
const DEFAULT_DIRECTIVE: &str = "tutor_rtc=info";

/// Installs the global fmt subscriber. `RUST_LOG` overrides the default
/// filter; calling this again (or after another subscriber was set) is a no-op.
pub fn init(config: &Config) -> bool {
    if !config.logging {
        return false;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoUtc::new("%Y-%m-%d %H:%M:%S%.3f".into()))
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Trickled candidate as it appears.
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            label,
            candidate = %init.candidate,
            sdp_mid = ?init.sdp_mid,
            sdp_mline_index = ?init.sdp_mline_index,
            username_fragment = ?init.username_fragment,
            "trickle"
        );
    }
}

/// Nominated candidate pair from a stats snapshot.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                debug!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}
