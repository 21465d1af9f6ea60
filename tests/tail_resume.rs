use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use liqstream::feed::hyperliquid::{LogTailAdapter, TailCursor, TailSettings, TailState, MAX_READ_BYTES};
use liqstream::feed::FeedAdapter;
use tempfile::TempDir;

fn liq_line(px: u32) -> String {
    format!(
        r#"{{"block_time":"2025-09-23T12:00:01.250","events":[["0xabc",{{"coin":"ETH","px":"{}","sz":"-2","side":"A","liquidation":{{"liquidatedUser":"0xabc"}}}}]]}}"#,
        px
    )
}

fn append(path: &Path, text: &str) {
    let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

fn settings(root: &Path, cursor: &Path) -> TailSettings {
    TailSettings {
        root: root.to_path_buf(),
        poll_interval: Duration::from_millis(5),
        cursor_path: Some(cursor.to_path_buf()),
        min_abs_size: 0.0,
        rotate_grace: Duration::ZERO,
        max_read_bytes: MAX_READ_BYTES,
    }
}

fn prices(tail: &mut LogTailAdapter) -> Vec<String> {
    let mut out = Vec::new();
    for _ in 0..6 {
        if let Some(records) = tail.poll_once().unwrap() {
            out.extend(records.iter().map(|r| r.payload["px"].as_str().unwrap().to_string()));
        }
    }
    out
}

#[tokio::test]
async fn restart_resumes_from_persisted_cursor_without_gaps_or_repeats() {
    let logs = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let cursor_path = state.path().join("hl_cursor.json");
    let day = logs.path().join("20250923");
    fs::create_dir_all(&day).unwrap();
    let h12 = day.join("12");
    append(&h12, &format!("{}\n", liq_line(1)));

    let mut first = LogTailAdapter::new(settings(logs.path(), &cursor_path));
    first.connect().await.unwrap();
    append(&h12, &format!("{}\n{}\n", liq_line(2), liq_line(3)));
    assert_eq!(prices(&mut first), vec!["2", "3"]);
    first.disconnect().await;
    drop(first);

    // Written while the process was down, including a rotation and a partial line.
    append(&h12, &format!("{}\n", liq_line(4)));
    let h13 = day.join("13");
    let tail_line = liq_line(6);
    let (head, rest) = tail_line.split_at(30);
    append(&h13, &format!("{}\n{}", liq_line(5), head));

    let saved = TailCursor::load(&cursor_path).unwrap();
    assert_eq!(saved.file, h12);

    let mut second = LogTailAdapter::new(settings(logs.path(), &cursor_path));
    assert_eq!(second.state(), TailState::ResumingAfterGap);
    second.connect().await.unwrap();
    assert_eq!(prices(&mut second), vec!["4", "5"]);
    assert_eq!(second.state(), TailState::Tailing);

    append(&h13, &format!("{}\n", rest));
    assert_eq!(prices(&mut second), vec!["6"]);
    assert_eq!(TailCursor::load(&cursor_path).unwrap().file, h13);
}

#[tokio::test]
async fn receive_yields_records_as_a_frame() {
    let logs = TempDir::new().unwrap();
    let day = logs.path().join("20250923");
    fs::create_dir_all(&day).unwrap();
    let h1 = day.join("1");
    append(&h1, "");

    let mut tail = LogTailAdapter::new(TailSettings {
        root: logs.path().to_path_buf(),
        poll_interval: Duration::from_millis(5),
        cursor_path: None,
        min_abs_size: 0.0,
        rotate_grace: Duration::ZERO,
        max_read_bytes: MAX_READ_BYTES,
    });
    tail.connect().await.unwrap();
    append(&h1, &format!("{}\n", liq_line(7)));
    let frame = tokio::time::timeout(Duration::from_secs(5), tail.receive())
        .await
        .unwrap()
        .unwrap();
    match frame {
        liqstream::feed::Frame::Records(records) => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].payload["coin"], "ETH");
        }
        _ => panic!("expected records"),
    }
}
