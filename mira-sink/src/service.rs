//! Sink service: wires the receiver core to its collaborators.
//!
//! The decode and presentation layers live outside this process; here
//! they are stood in for by a pipeline and an event loop that only log.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use mira_core::{
    DecodePipeline, DeviceIdentity, EventReceiver, FileStore, FormatDescription, MiraError,
    MirrorService, SinkEvent, VideoFrame, event_channel,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SinkConfig;

/// Frames between progress lines.
const FRAME_LOG_INTERVAL: u64 = 600;

// ── LoggingPipeline ──────────────────────────────────────────────

/// Decode pipeline that accepts frames once a format is configured and
/// counts them.
#[derive(Debug, Default)]
pub struct LoggingPipeline {
    configured: AtomicBool,
    frames: AtomicU64,
    key_frames: AtomicU64,
}

impl LoggingPipeline {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn key_frames(&self) -> u64 {
        self.key_frames.load(Ordering::Relaxed)
    }
}

impl DecodePipeline for LoggingPipeline {
    fn configure(&self, format: &FormatDescription) {
        self.configured.store(true, Ordering::SeqCst);
        info!(
            sps = format.sps.len(),
            pps = format.pps.as_ref().map_or(0, |p| p.len()),
            "decoder format configured"
        );
    }

    fn has_session(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    fn submit(&self, frame: VideoFrame) {
        if frame.key_frame {
            self.key_frames.fetch_add(1, Ordering::Relaxed);
        }
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if n % FRAME_LOG_INTERVAL == 0 {
            info!(frames = n, key_frames = self.key_frames(), "frames received");
        } else {
            debug!(len = frame.data.len(), key = frame.key_frame, "frame");
        }
    }
}

// ── SinkService ──────────────────────────────────────────────────

/// The top-level sink service.
pub struct SinkService {
    config: SinkConfig,
    cancel: CancellationToken,
}

impl SinkService {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the service from another task.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the service until stopped.
    ///
    /// 1. Opens the identity store under `state_dir`.
    /// 2. Starts the receiver, logs its presence records and writes them
    ///    to `advertisement.json` for the discovery advertiser.
    /// 3. Logs receiver events until the stop token fires.
    pub async fn run(&self) -> Result<(), MiraError> {
        let receiver_config = self.config.to_receiver_config()?;
        let store = Arc::new(FileStore::open(self.config.identity_path())?);
        let identity = Arc::new(DeviceIdentity::new(store));
        let pipeline = Arc::new(LoggingPipeline::default());
        let (events_tx, events_rx) = event_channel();

        let events = tokio::spawn(log_events(events_rx));

        let receiver = MirrorService::new(receiver_config, identity, pipeline.clone(), events_tx);
        let running = receiver.start().await?;

        let ad = running.advertisement();
        info!(
            name = %ad.name,
            control_port = ad.control_port,
            data_port = ad.data_port,
            "presence records ready"
        );
        for (key, value) in ad.txt_records() {
            info!("  {key}={value}");
        }
        let ad_path = self.config.advertisement_path();
        if let Err(e) = std::fs::write(&ad_path, ad.to_json()?) {
            warn!("cannot write {}: {e}", ad_path.display());
        }

        self.cancel.cancelled().await;
        receiver.stop();
        running.join().await;
        drop(receiver);

        if let Err(e) = events.await {
            warn!("event loop ended abnormally: {e}");
        }
        info!(
            frames = pipeline.frames(),
            key_frames = pipeline.key_frames(),
            "sink stopped"
        );
        Ok(())
    }
}

async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            SinkEvent::Connected { peer } => info!(%peer, "device connected"),
            SinkEvent::Disconnected => info!("device disconnected"),
            SinkEvent::Error { description } => error!("receiver error: {description}"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(key_frame: bool) -> VideoFrame {
        VideoFrame {
            key_frame,
            data: vec![0, 0, 0, 1, 0x65].into(),
        }
    }

    #[test]
    fn pipeline_needs_format_before_session() {
        let pipeline = LoggingPipeline::default();
        assert!(!pipeline.has_session());

        pipeline.configure(&FormatDescription {
            sps: vec![0x67].into(),
            pps: None,
        });
        assert!(pipeline.has_session());

        pipeline.submit(frame(true));
        pipeline.submit(frame(false));
        assert_eq!(pipeline.frames(), 2);
        assert_eq!(pipeline.key_frames(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SinkConfig::default();
        config.network.bind_address = "127.0.0.1".into();
        config.network.control_port = 0;
        config.network.data_port = 0;
        config.device.state_dir = dir.path().join("state");

        let service = SinkService::new(config.clone());
        let stop = service.stop_handle();
        let task = tokio::spawn(async move { service.run().await });

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        stop.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("service did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert!(config.identity_path().exists());

        let ad = std::fs::read_to_string(config.advertisement_path()).unwrap();
        assert!(ad.contains("0x5A7FFFF7,0x1E"));
    }
}
