// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::Drain;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

pub(crate) fn test_logger() -> slog::Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, slog::o!("test" => "node-maintenance"))
}

/// Runs `f` to completion on a current-thread runtime with paused time.
///
/// `#[proptest]` bodies are synchronous, so they cannot use
/// `#[tokio::test]`.
pub(crate) fn with_test_runtime<F, Fut, T>(f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("built test runtime");
    runtime.block_on(f())
}

/// Captures events in the same bunyan format the event log file uses.
#[derive(Clone, Default)]
pub(crate) struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CapturedLog {
    pub(crate) fn logger(&self) -> slog::Logger {
        let drain = slog_bunyan::with_name("node-maintenance", self.clone())
            .build()
            .fuse();
        slog::Logger::root(Mutex::new(drain).fuse(), slog::o!())
    }

    /// Every event logged so far, in order.
    pub(crate) fn events(&self) -> Vec<serde_json::Value> {
        let contents = self.0.lock().unwrap().clone();
        String::from_utf8(contents)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    /// Events with the given message.
    pub(crate) fn named(&self, msg: &str) -> Vec<serde_json::Value> {
        self.events().into_iter().filter(|event| event["msg"] == msg).collect()
    }
}
