// SPDX-License-Identifier: Apache-2.0

//! End-to-end tailing scenarios: restarts, rotation and shutdown draining.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tailship::tail::{
    Line, LineConsumer, MonitoredFile, TailState, TailedFiles, Tailer, TailerConfig, WriterSink,
    state_path_for,
};
use tempfile::tempdir;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Collector {
    lines: Mutex<Vec<String>>,
    idle: AtomicUsize,
    ack_on_idle: bool,
}

impl Collector {
    fn acking() -> Self {
        Self {
            ack_on_idle: true,
            ..Default::default()
        }
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl LineConsumer for Collector {
    fn on_line_available(&self, line: &Line<'_>) -> bool {
        self.lines
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(line.content()).into_owned());
        true
    }

    fn on_idle(&self, files: &mut TailedFiles) {
        self.idle.fetch_add(1, Ordering::SeqCst);
        if self.ack_on_idle {
            files.ack_all();
        }
    }
}

fn config() -> TailerConfig {
    TailerConfig {
        idle_interval_ms: 10,
        ..Default::default()
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Run a tailer over `path` until `expected` lines arrived and the worker went idle again.
fn run_session(path: &Path, consumer: Arc<Collector>, expected: usize) -> Vec<String> {
    let mut tailer = Tailer::new(config(), consumer.clone()).unwrap();
    tailer.tail_file(path).unwrap();
    tailer.start().unwrap();

    assert!(wait_for(|| consumer.lines().len() >= expected));
    let idle = consumer.idle.load(Ordering::SeqCst);
    assert!(wait_for(|| consumer.idle.load(Ordering::SeqCst) > idle));
    assert!(tailer.stop(TEST_TIMEOUT));
    consumer.lines()
}

#[test]
fn test_unacked_lines_are_redelivered_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, "foo\nbar\n").unwrap();

    let first = run_session(&path, Arc::new(Collector::default()), 2);
    assert_eq!(first, vec!["foo", "bar"]);

    // Nothing was acked, so a restart starts over
    let second = run_session(&path, Arc::new(Collector::default()), 2);
    assert_eq!(second, vec!["foo", "bar"]);
}

#[test]
fn test_acked_lines_are_not_redelivered() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, "foo\nbar\n").unwrap();

    let first = run_session(&path, Arc::new(Collector::acking()), 2);
    assert_eq!(first, vec!["foo", "bar"]);

    let mut f = OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(b"baz\n").unwrap();
    drop(f);

    let second = run_session(&path, Arc::new(Collector::acking()), 1);
    assert_eq!(second, vec!["baz"]);

    let state = fs::read_to_string(state_path_for(&path)).unwrap();
    assert!(state.contains("position=12\n"));
}

#[cfg(unix)]
#[test]
fn test_follows_rename_rotation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    let rotated = dir.path().join("app.log.1");

    let mut writer = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .unwrap();
    writer.write_all(b"a\nb\n").unwrap();

    let consumer = Arc::new(Collector::acking());
    let mut tailer = Tailer::new(config(), consumer.clone()).unwrap();
    tailer.tail_file(&path).unwrap();
    tailer.start().unwrap();
    assert!(wait_for(|| consumer.lines().len() == 2));

    // The writer finishes its last line and the file is renamed away
    writer.write_all(b"c\n").unwrap();
    fs::rename(&path, &rotated).unwrap();
    fs::write(&path, "d\n").unwrap();

    assert!(wait_for(|| consumer.lines().len() == 4));
    assert_eq!(consumer.lines(), vec!["a", "b", "c", "d"]);

    let idle = consumer.idle.load(Ordering::SeqCst);
    assert!(wait_for(|| consumer.idle.load(Ordering::SeqCst) > idle));
    assert!(tailer.stop(TEST_TIMEOUT));

    // Progress now refers to the new file
    let file = MonitoredFile::open(&path).unwrap();
    assert_eq!(file.position(), 2);
}

#[cfg(unix)]
#[test]
fn test_rotation_while_stopped_ships_rest_of_old_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, "one\n").unwrap();

    let first = run_session(&path, Arc::new(Collector::acking()), 1);
    assert_eq!(first, vec!["one"]);

    let mut f = OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(b"two\n").unwrap();
    drop(f);
    fs::rename(&path, dir.path().join("app.log.1")).unwrap();
    fs::write(&path, "three\n").unwrap();

    let second = run_session(&path, Arc::new(Collector::acking()), 2);
    assert_eq!(second, vec!["two", "three"]);
}

/// A writer whose output can be inspected while the sink owns it
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_writer_sink_end_to_end() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.log");
    let b = dir.path().join("b.log");
    fs::write(&a, "a1\na2\n").unwrap();
    fs::write(&b, "b1\r\n").unwrap();

    let out = SharedBuffer::default();
    let sink = Arc::new(WriterSink::new(out.clone()));
    let mut tailer = Tailer::new(config(), sink).unwrap();
    tailer.tail_file(&a).unwrap();
    tailer.tail_file(&b).unwrap();
    tailer.start().unwrap();

    assert!(wait_for(|| out.0.lock().unwrap().len() == 9));
    assert!(tailer.stop(TEST_TIMEOUT));

    let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
    let mut lines: Vec<&str> = text.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["a1", "a2", "b1"]);

    // Flushed output is acknowledged at the latest on shutdown
    assert_eq!(MonitoredFile::open(&a).unwrap().position(), 6);
    assert_eq!(MonitoredFile::open(&b).unwrap().position(), 4);
}

/// Position recorded in the state file right now, 0 while it is being rewritten
fn persisted_position(path: &Path) -> u64 {
    fs::read_to_string(state_path_for(path))
        .ok()
        .and_then(|text| TailState::decode(&text, None).ok().flatten())
        .map(|state| state.position)
        .unwrap_or(0)
}

#[test]
fn test_progress_is_persisted_while_file_keeps_growing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("busy.log");
    fs::write(&path, "").unwrap();

    let writing = Arc::new(AtomicBool::new(true));
    let appender = {
        let path = path.clone();
        let writing = writing.clone();
        thread::spawn(move || {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            let mut n: u64 = 0;
            while writing.load(Ordering::SeqCst) {
                writeln!(f, "busy line {}", n).unwrap();
                n += 1;
                if n % 100 == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        })
    };

    let out = SharedBuffer::default();
    let sink =
        Arc::new(WriterSink::new(out.clone()).with_flush_interval(Duration::from_millis(20)));
    let mut tailer = Tailer::new(config(), sink).unwrap();
    tailer.tail_file(&path).unwrap();
    tailer.start().unwrap();

    // Acknowledged progress moves forward while the writer is still going
    assert!(wait_for(|| persisted_position(&path) > 0));
    let first = persisted_position(&path);
    assert!(wait_for(|| persisted_position(&path) > first));

    writing.store(false, Ordering::SeqCst);
    appender.join().unwrap();
    let size = fs::metadata(&path).unwrap().len();
    assert!(wait_for(|| out.0.lock().unwrap().len() as u64 == size));
    assert!(tailer.stop(TEST_TIMEOUT));

    assert_eq!(MonitoredFile::open(&path).unwrap().position(), size);
}

#[test]
fn test_file_created_after_start() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("late.log");

    let consumer = Arc::new(Collector::default());
    let mut tailer = Tailer::new(config(), consumer.clone()).unwrap();
    tailer.tail_file(&path).unwrap();
    tailer.start().unwrap();
    assert!(wait_for(|| consumer.idle.load(Ordering::SeqCst) > 2));

    fs::write(&path, "hello\n").unwrap();
    assert!(wait_for(|| consumer.lines() == vec!["hello"]));
    assert!(tailer.stop(TEST_TIMEOUT));
}
