//! Transcode Bridge (C10, §4.10, §6). Wire protocol and bridge loop for a
//! child transcode process reached via an external collaborator stream.
//!
//! Grounded on the `PipelineCommand` channel-message enum and its
//! consumer loop in `examples/v0l-zap-stream-core/crates/core/src/pipeline/runner.rs`
//! — the teacher already models "egress/ingress talk to the pipeline via
//! tagged messages on a channel"; this generalizes that shape to a
//! bidirectional stream of `TranscodeMessage`s instead of an in-process enum.

use crate::buffer::SharedBuffer;
use crate::error::RelayError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// No batches for this long means the child is wedged; abort and let
/// session-level recovery (fallback/restart) take over.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Video,
    Audio,
}

#[derive(Debug, Clone)]
pub struct EsSample {
    pub pts_us: i64,
    pub dts_us: i64,
    pub bytes: bytes::Bytes,
    pub track: Track,
    pub is_keyframe: bool,
}

#[derive(Debug, Clone)]
pub struct TranscodeStart {
    pub input_url: String,
    pub target_video_codec: Option<String>,
    pub target_audio_codec: Option<String>,
    pub segment_duration: f64,
}

/// Messages the bridge receives from the child process.
#[derive(Debug)]
pub enum TranscodeInbound {
    SampleBatch { job_id: String, samples: Vec<EsSample> },
    Ack { job_id: String },
    Stats { bitrate_bps: u64, dropped_samples: u64 },
    Error { message: String },
    Stop,
}

/// Messages the bridge sends to the child process.
#[derive(Debug)]
pub enum TranscodeOutbound {
    Start(TranscodeStart),
    Stop,
}

pub struct TranscodeBridge;

impl TranscodeBridge {
    /// Drives one transcode job: sends `Start`, then consumes inbound
    /// messages until `Stop`, a fatal `Error`, heartbeat timeout, or
    /// cancellation. Sample batches are written into `buffer` with
    /// `is_keyframe` forwarded verbatim (samples already arrive typed).
    pub async fn run(
        start: TranscodeStart,
        outbound: mpsc::Sender<TranscodeOutbound>,
        mut inbound: mpsc::Receiver<TranscodeInbound>,
        buffer: &SharedBuffer,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        outbound
            .send(TranscodeOutbound::Start(start))
            .await
            .map_err(|_| RelayError::TranscodeError("child process channel closed before start".to_string()))?;

        loop {
            let message = tokio::select! {
                msg = inbound.recv() => msg,
                _ = cancel.cancelled() => {
                    let _ = outbound.send(TranscodeOutbound::Stop).await;
                    return Ok(());
                }
                _ = tokio::time::sleep(HEARTBEAT_TIMEOUT) => {
                    warn!("transcode bridge heartbeat timeout, aborting");
                    return Err(RelayError::TranscodeError("heartbeat timeout".to_string()));
                }
            };

            match message {
                None => return Err(RelayError::TranscodeError("child process channel closed".to_string())),
                Some(TranscodeInbound::SampleBatch { samples, .. }) => {
                    for sample in samples {
                        if let Err(e) = buffer.write_chunk(sample.bytes, Some(sample.is_keyframe)) {
                            return Err(e);
                        }
                    }
                }
                Some(TranscodeInbound::Ack { .. }) => {}
                Some(TranscodeInbound::Stats { bitrate_bps, dropped_samples }) => {
                    if dropped_samples > 0 {
                        warn!(bitrate_bps, dropped_samples, "transcode child reports dropped samples");
                    }
                }
                Some(TranscodeInbound::Error { message }) => {
                    error!(message, "transcode child reported a fatal error");
                    return Err(RelayError::TranscodeError(message));
                }
                Some(TranscodeInbound::Stop) => return Ok(()),
            }
        }
    }
}
