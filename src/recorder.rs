// ===============================
// src/recorder.rs
// ===============================
//
// JSONL metrics recorder:
// - JsonlLogger hands each logged step to a background task (never blocks the step).
// - The task appends one JSON record per line through a BufWriter.
// - Flush every second and every 1000 records; parent directory created if missing.
// - On a failed write the file is reopened once, then the record is dropped.
//
use serde::Serialize;
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::{Phase, RunInfo, Timestamp};
use crate::error::Result;
use crate::logger::MetricsLogger;
use crate::metrics::{Component, MetricResults};

const FLUSH_EVERY_N_RECORDS: u32 = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub run: String,
    pub episode: u32,
    pub phase: Phase,
    pub step: u64,
    pub time: Option<Timestamp>,
    pub metrics: MetricResults,
}

pub struct JsonlLogger {
    tx: mpsc::Sender<Record>,
    dropped: u64,
}

impl JsonlLogger {
    /// Start the recorder task writing to `path`. Must be called inside a tokio runtime.
    /// The task ends (after a final flush) once the logger is dropped.
    pub fn spawn(path: impl Into<String>, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(run(rx, path.into()));
        (Self { tx, dropped: 0 }, handle)
    }
}

impl Component for JsonlLogger {
    fn get_metrics(&mut self) -> MetricResults {
        let mut out = MetricResults::new();
        if self.dropped > 0 {
            out.insert("recorder.dropped".into(), std::mem::take(&mut self.dropped) as f64);
        }
        out
    }
}

impl MetricsLogger for JsonlLogger {
    fn log(&mut self, results: &MetricResults, run: &RunInfo) {
        let record = Record {
            run: run.run.clone(),
            episode: run.episode,
            phase: run.phase,
            step: run.step,
            time: run.time,
            metrics: results.clone(),
        };
        if let Err(e) = self.tx.try_send(record) {
            self.dropped += 1;
            warn!(%e, "recorder: record dropped");
        }
    }
}

async fn open_writer(path: &str) -> Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Record>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(%e, %path, "recorder: open failed, recording disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_rec = rx.recv() => {
                let Some(rec) = maybe_rec else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&rec) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(%e, "recorder: serialize error, skip record");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(%e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e) => {
                            error!(%e, "recorder: reopen failed, stopped");
                            break;
                        }
                    }
                    if let Err(e) = write_line(&mut writer, &line).await {
                        error!(%e, "recorder: write failed again after reopen, drop record");
                        continue;
                    }
                }
                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_RECORDS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}
