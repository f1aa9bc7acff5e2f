//! CSV run log.
//!
//! Subscribes to the [`EventBus`] and writes one row per event:
//!
//! | column | content |
//! |---|---|
//! | `elapsed_s` | seconds since the recorder started |
//! | `source` | publisher (`run:<id>`, device id, `safety`) |
//! | `event` | event kind |
//! | `subject` | device, step, group or run the event is about |
//! | `detail` | human-readable payload |

use std::fs::File;
use std::path::{Path, PathBuf};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{Event, EventBus, EventKind, Subscription};
use crate::error::{LabError, LabResult};

const HEADER: [&str; 5] = ["elapsed_s", "source", "event", "subject", "detail"];

/// Subject and detail columns for an event.
pub fn describe(kind: &EventKind) -> (String, String) {
    match kind {
        EventKind::Telemetry(t) => (
            t.device_id.clone(),
            format!("{}={} {}", t.field, t.value, t.unit),
        ),
        EventKind::DeviceState { device_id, from, to } => {
            (device_id.clone(), format!("{from} -> {to}"))
        }
        EventKind::RunStatus {
            run_id,
            method,
            status,
        } => (run_id.to_string(), format!("{method}: {status}")),
        EventKind::StepStatus {
            step,
            status,
            detail,
            ..
        } => (
            step.clone(),
            match detail {
                Some(d) => format!("{status}: {d}"),
                None => status.to_string(),
            },
        ),
        EventKind::GroupCompleted { group, .. } => (group.clone(), "completed".to_string()),
        EventKind::SafetyTrip {
            rule,
            device_id,
            field,
            value,
            action,
        } => (
            device_id.clone(),
            format!("{rule}: {field}={value} -> {action}"),
        ),
    }
}

fn storage_error(err: csv::Error) -> LabError {
    LabError::Io(err.to_string())
}

/// Background writer of a CSV run log.
#[derive(Debug)]
pub struct CsvRecorder {
    path: PathBuf,
    stop: CancellationToken,
    task: JoinHandle<LabResult<u64>>,
}

impl CsvRecorder {
    /// Create `path` (and its parent directories), write the header and
    /// start recording every event published from now on.
    pub fn start(bus: &EventBus, path: impl Into<PathBuf>) -> LabResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(HEADER).map_err(storage_error)?;
        writer.flush()?;

        let subscription = bus.subscribe();
        let stop = CancellationToken::new();
        let task = tokio::spawn(record(writer, subscription, stop.clone()));
        info!(path = %path.display(), "CSV run log started");
        Ok(Self { path, stop, task })
    }

    /// Start a log for one run of `method` at `dir/{method}_{YYYYmmdd_HHMMSS}.csv`.
    pub fn for_run(
        bus: &EventBus,
        dir: &Path,
        method: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> LabResult<Self> {
        let file = format!("{method}_{}.csv", at.format("%Y%m%d_%H%M%S"));
        Self::start(bus, dir.join(file))
    }

    /// Output file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write everything already published, flush and close the file.
    /// Returns the number of rows written.
    pub async fn finish(self) -> LabResult<u64> {
        self.stop.cancel();
        let rows = self
            .task
            .await
            .map_err(|e| LabError::Io(format!("recorder task failed: {e}")))??;
        info!(path = %self.path.display(), rows, "CSV run log closed");
        Ok(rows)
    }
}

async fn record(
    mut writer: csv::Writer<File>,
    mut events: Subscription,
    stop: CancellationToken,
) -> LabResult<u64> {
    let origin = tokio::time::Instant::now();
    let mut rows = 0u64;
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        write_row(&mut writer, origin, &event)?;
        rows += 1;
    }
    for event in events.drain() {
        write_row(&mut writer, origin, &event)?;
        rows += 1;
    }
    writer.flush()?;
    debug!(rows, "Run log drained");
    Ok(rows)
}

fn write_row(
    writer: &mut csv::Writer<File>,
    origin: tokio::time::Instant,
    event: &Event,
) -> LabResult<()> {
    let (subject, detail) = describe(&event.kind);
    writer
        .write_record([
            format!("{:.3}", origin.elapsed().as_secs_f64()),
            event.source.clone(),
            event.kind.name().to_string(),
            subject,
            detail,
        ])
        .map_err(storage_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Telemetry;
    use crate::device::{DeviceCategory, HandleState};

    #[tokio::test]
    async fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("run.csv");
        let bus = EventBus::new();
        let recorder = CsvRecorder::start(&bus, &path).unwrap();

        bus.publish(
            "pump1",
            EventKind::DeviceState {
                device_id: "pump1".into(),
                from: HandleState::Ready,
                to: HandleState::Busy,
            },
        );
        bus.publish_telemetry(Telemetry {
            category: DeviceCategory::Pump,
            device_id: "pump1".into(),
            field: "pressure".into(),
            value: 1.5,
            unit: "bar".into(),
        });

        assert_eq!(recorder.finish().await.unwrap(), 2);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), HEADER);
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(&rows[0][2], "device_state");
        assert_eq!(&rows[0][4], "ready -> busy");
        assert_eq!(&rows[1][3], "pump1");
        assert_eq!(&rows[1][4], "pressure=1.5 bar");
    }

    #[tokio::test]
    async fn run_logs_are_named_after_method_and_start_time() {
        use chrono::TimeZone;

        let dir = tempfile::tempdir().unwrap();
        let at = chrono::Utc.with_ymd_and_hms(2026, 3, 14, 9, 5, 7).unwrap();
        let recorder = CsvRecorder::for_run(&EventBus::new(), dir.path(), "heat_and_dispense", at)
            .unwrap();

        assert_eq!(
            recorder.path(),
            dir.path().join("heat_and_dispense_20260314_090507.csv")
        );
        assert_eq!(recorder.finish().await.unwrap(), 0);
    }
}
