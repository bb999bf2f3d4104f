//! Microphone uplink: capture frames → agent
//!
//! ```text
//! Audio Thread (sync)              Tokio Runtime (async)
//! ┌──────────────────┐             ┌──────────────────────┐
//! │ capture callback │──channel──▶ │ AudioUplink::run()   │
//! │ send(frame)      │             │   └─ send_audio_chunk│
//! └──────────────────┘             └──────────────────────┘
//! ```
//!
//! Frames already have the wire size and rate, so the uplink forwards each
//! one as a single chunk without re-buffering.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::TransportSession;
use crate::audio::AudioFrame;

/// Counts from one uplink run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UplinkStats {
    pub chunks_sent: u64,
    pub chunks_skipped: u64,
}

/// Pumps captured frames into the transport until cancelled or the
/// capture channel closes.
pub struct AudioUplink {
    transport: TransportSession,
    rx: mpsc::UnboundedReceiver<AudioFrame>,
    cancel: CancellationToken,
}

impl AudioUplink {
    pub fn new(
        transport: TransportSession,
        rx: mpsc::UnboundedReceiver<AudioFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            rx,
            cancel,
        }
    }

    pub async fn run(mut self) -> UplinkStats {
        log::info!("AudioUplink: starting");
        let mut stats = UplinkStats::default();

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = self.rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            if self.transport.send_audio_chunk(&frame) {
                stats.chunks_sent += 1;
                if stats.chunks_sent % 100 == 0 {
                    log::debug!("AudioUplink: {} chunks sent", stats.chunks_sent);
                }
            } else {
                stats.chunks_skipped += 1;
            }
        }

        log::info!(
            "AudioUplink: stopped ({} sent, {} skipped)",
            stats.chunks_sent,
            stats.chunks_skipped
        );
        stats
    }
}
