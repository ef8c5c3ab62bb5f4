//! Streaming request body that reports progress and enforces the upload cap.
//!
//! The cap is re-read from the live configuration before every chunk, so an
//! operator change takes effect mid-upload. Throttling keeps the cumulative
//! average rate at or below the cap: before chunk `n+1` goes out, at least
//! `sent / rate` seconds must have elapsed.
use crate::config::ConfigWatcher;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;

pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Invoked with `(sent, total)` at the start of the body and after every chunk.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

struct BodyState {
    file: fs_err::tokio::File,
    sent: u64,
    total: u64,
    started: Instant,
    config: Arc<ConfigWatcher>,
    progress: ProgressFn,
}

/// Open `path` and build a throttled, progress-reporting request body.
/// Returns the body and the file's total size.
pub(crate) async fn throttled_file_body(
    path: &camino::Utf8Path,
    config: Arc<ConfigWatcher>,
    progress: ProgressFn,
) -> std::io::Result<(reqwest::Body, u64)> {
    let file = fs_err::tokio::File::open(path).await?;
    let total = file.metadata().await?.len();
    progress(0, total);
    let state = BodyState {
        file,
        sent: 0,
        total,
        started: Instant::now(),
        config,
        progress,
    };
    Ok((reqwest::Body::wrap_stream(chunk_stream(state)), total))
}

fn chunk_stream(
    state: BodyState,
) -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::try_unfold(state, |mut state| async move {
        let cap = state.config.get().upload_cap_kbps();
        if let Some(delay) = throttle_delay(state.sent, state.started.elapsed(), cap) {
            tokio::time::sleep(delay).await;
        }
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = state.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        state.sent += n as u64;
        (state.progress)(state.sent, state.total);
        Ok(Some((Bytes::from(buf), state)))
    })
}

/// How long to wait before the next chunk so that `sent` bytes never exceed
/// `cap_kbps * 1024 * elapsed`.
fn throttle_delay(sent: u64, elapsed: Duration, cap_kbps: Option<u64>) -> Option<Duration> {
    let rate = cap_kbps? * 1024;
    let required = Duration::from_secs_f64(sent as f64 / rate as f64);
    required.checked_sub(elapsed).filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::settings_with_cap;
    use futures::StreamExt;

    #[test]
    fn test_no_cap_means_no_delay() {
        assert_eq!(throttle_delay(10 << 20, Duration::from_millis(1), None), None);
    }

    #[test]
    fn test_delay_enforces_cumulative_average() {
        // 200 KiB sent in 1 s at a 100 KiB/s cap: wait another second.
        let delay = throttle_delay(200 * 1024, Duration::from_secs(1), Some(100)).unwrap();
        assert!((delay.as_secs_f64() - 1.0).abs() < 0.01, "{delay:?}");
        // Already slower than the cap: no delay.
        assert_eq!(
            throttle_delay(50 * 1024, Duration::from_secs(1), Some(100)),
            None
        );
    }

    #[tokio::test]
    async fn test_stream_paces_reads_and_follows_cap_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("volume.dcm")).unwrap();
        fs_err::write(path.as_path(), vec![7u8; 3 * CHUNK_SIZE]).unwrap();

        // 64 KiB/s: the second chunk may not leave before t = 1 s.
        let config = ConfigWatcher::fixed(settings_with_cap(Some(64)));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let progress: ProgressFn = {
            let seen = Arc::clone(&seen);
            Arc::new(move |sent, total| seen.lock().unwrap().push((sent, total)))
        };

        let file = fs_err::tokio::File::open(&path).await.unwrap();
        let state = BodyState {
            file,
            sent: 0,
            total: (3 * CHUNK_SIZE) as u64,
            started: Instant::now(),
            config: Arc::clone(&config),
            progress,
        };
        let started = Instant::now();
        let mut stream = Box::pin(chunk_stream(state));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), CHUNK_SIZE);
        assert!(started.elapsed() < Duration::from_millis(500));

        let _second = stream.next().await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(950));

        // Raising the cap mid-upload takes effect for the next chunk.
        config.set_fixed(settings_with_cap(None));
        let _third = stream.next().await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(stream.next().await.is_none());

        let seen = seen.lock().unwrap();
        let total = (3 * CHUNK_SIZE) as u64;
        assert_eq!(seen.last(), Some(&(total, total)));
    }
}
