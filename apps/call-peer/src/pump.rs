//! Keeps synthetic audio flowing while a call holds local media. The peer
//! has no microphone, so it sends Opus comfort-noise frames; video tracks
//! stay dark.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use call_core::CallSnapshot;
use call_media::{LocalTrack, TrackKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A single Opus silence frame.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const FRAME: Duration = Duration::from_millis(20);

/// Starts a feeder for every new local audio track the engine publishes.
pub fn spawn(mut snapshots: watch::Receiver<CallSnapshot>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut fed: Option<String> = None;
        loop {
            let audio = snapshots
                .borrow_and_update()
                .local
                .as_ref()
                .and_then(|local| local.track(TrackKind::Audio).cloned());
            if let Some(track) = audio {
                if fed.as_deref() != Some(track.id()) {
                    fed = Some(track.id().to_string());
                    tokio::spawn(feed(track));
                }
            }
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    })
}

/// Writes a frame every 20ms until the track is stopped.
async fn feed(track: Arc<LocalTrack>) {
    debug!(track = track.id(), "feeding synthetic audio");
    let mut ticker = tokio::time::interval(FRAME);
    let mut frames = 0u64;
    loop {
        ticker.tick().await;
        if track.is_stopped() {
            break;
        }
        if let Err(err) = track
            .write_sample(Bytes::from_static(OPUS_SILENCE), FRAME)
            .await
        {
            debug!(track = track.id(), error = %err, "synthetic audio stopped");
            break;
        }
        frames += 1;
    }
    trace!(track = track.id(), frames, "synthetic audio feeder done");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn feeder_stops_with_its_track() {
        let track = Arc::new(LocalTrack::new(TrackKind::Audio, "audio-test"));
        let feeder = tokio::spawn(feed(Arc::clone(&track)));
        tokio::time::sleep(FRAME * 3).await;
        assert!(!feeder.is_finished());

        track.stop();
        feeder.await.expect("feeder exits");
    }
}
