// ===============================
// src/recorder.rs
// ===============================
//
// JSONL session recorder:
// - Appends every inbound transport event to a .jsonl file.
// - Buffered with BufWriter to save syscalls.
// - Periodic flush every 1s and/or every 1000 events.
// - Creates the parent directory if it does not exist.
// - On write failure, reopens the file and carries on.
//
// Enabled by the `RecordFile` configuration key (see main.rs).

use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::transport::TransportEvent;

async fn open_writer(path: &str) -> Option<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            error!(?e, %path, "recorder: open failed, recording disabled");
            None
        }
    }
}

pub async fn run(mut rx: mpsc::UnboundedReceiver<TransportEvent>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = match open_writer(&path).await {
        Some(writer) => writer,
        None => return,
    };

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        let line = match serde_json::to_string(&event) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, "recorder: serialize error, skip event");
                                continue;
                            }
                        };

                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(?e, "recorder: write failed, attempting reopen");
                            match open_writer(&path).await {
                                Some(reopened) => writer = reopened,
                                None => return,
                            }
                            if let Err(e2) = writer.write_all(line.as_bytes()).await {
                                error!(?e2, "recorder: write failed again after reopen, drop event");
                                continue;
                            }
                        }
                        let _ = writer.write_all(b"\n").await;

                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                            let _ = writer.flush().await;
                            since_last_flush = 0;
                        }
                    }
                    None => {
                        let _ = writer.flush().await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_events_as_jsonl_and_flushes_on_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session/events.jsonl");

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(TransportEvent::Logon).unwrap();
        tx.send(TransportEvent::TextReject("bad request".to_string())).unwrap();
        drop(tx);

        run(rx, path.display().to_string()).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Logon"));
        assert!(lines[1].contains("bad request"));
        // Every line is standalone JSON.
        for line in lines {
            serde_json::from_str::<TransportEvent>(line).unwrap();
        }
    }
}
