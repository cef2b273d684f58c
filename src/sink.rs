//! Where measurements go once the executor has produced them.

use chrono::{DateTime, Local, Utc};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crate::error::SmuError;
use crate::executor::{SweepObserver, SweepProgress};
use crate::logger::RecordLogger;
use crate::types::Measurement;
use crate::waveform::SweepPoint;

/// One persisted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub timestamp: DateTime<Utc>,
    pub index: usize,
    pub voltage: f64,
    pub current: f64,
    pub cycle_id: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub relative_time_s: Option<f64>,
}

impl MeasurementRecord {
    pub fn new(index: usize, point: &SweepPoint, measurement: Measurement) -> Self {
        Self {
            timestamp: Utc::now(),
            index,
            voltage: measurement.voltage,
            current: measurement.current,
            cycle_id: point.cycle_id,
            relative_time_s: point.relative_time_s,
        }
    }
}

/// Everything an observer sees, as a value that can cross threads.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    Status(String),
    Progress(SweepProgress),
    Measurement(MeasurementRecord),
}

/// Forwards observer callbacks into a channel for a consumer thread.
pub struct ChannelObserver {
    sender: Sender<SweepEvent>,
    index: usize,
}

impl ChannelObserver {
    pub fn new(sender: Sender<SweepEvent>) -> Self {
        Self { sender, index: 0 }
    }

    fn send(&self, event: SweepEvent) {
        if self.sender.send(event).is_err() {
            debug!("Sweep event receiver dropped");
        }
    }
}

impl SweepObserver for ChannelObserver {
    fn on_status(&mut self, status: &str) {
        self.send(SweepEvent::Status(status.to_string()));
    }

    fn on_progress(&mut self, progress: &SweepProgress) {
        self.send(SweepEvent::Progress(*progress));
    }

    fn on_measurement(&mut self, point: &SweepPoint, measurement: Measurement) {
        self.index += 1;
        let record = MeasurementRecord::new(self.index, point, measurement);
        self.send(SweepEvent::Measurement(record));
    }
}

/// Record file fed by [`spawn_writer`].
pub struct JsonlRecorder {
    logger: RecordLogger<MeasurementRecord>,
}

impl JsonlRecorder {
    pub fn new<P: Into<PathBuf>>(path: P, buffer_size: usize) -> Self {
        Self {
            logger: RecordLogger::new(path, buffer_size, false),
        }
    }

    pub fn path(&self) -> &Path {
        self.logger.path()
    }

    pub fn record(&mut self, record: MeasurementRecord) -> Result<(), SmuError> {
        self.logger.add(record)
    }

    /// Flush everything and return the number of records on disk.
    pub fn finish(mut self) -> Result<usize, SmuError> {
        self.logger.finalize()?;
        Ok(self.logger.written())
    }
}

/// Timestamped record file name under `dir`, e.g. `sweep_20250101_120000.jsonl`.
pub fn timestamped_path(dir: &Path, prefix: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{prefix}_{stamp}.jsonl"))
}

/// Consume events until every sender is dropped. Measurements go to
/// `recorder` (if any); status and progress go to `on_event`.
pub fn spawn_writer<F>(
    receiver: Receiver<SweepEvent>,
    mut recorder: Option<JsonlRecorder>,
    mut on_event: F,
) -> JoinHandle<Result<usize, SmuError>>
where
    F: FnMut(&SweepEvent) + Send + 'static,
{
    thread::spawn(move || {
        let mut count = 0;
        for event in receiver.iter() {
            on_event(&event);
            if let SweepEvent::Measurement(record) = event {
                count += 1;
                if let Some(recorder) = recorder.as_mut() {
                    recorder.record(record)?;
                }
            }
        }
        match recorder {
            Some(recorder) => {
                let path = recorder.path().to_path_buf();
                let written = recorder.finish()?;
                info!("Wrote {written} records to {}", path.display());
                Ok(written)
            }
            None => Ok(count),
        }
    })
}
