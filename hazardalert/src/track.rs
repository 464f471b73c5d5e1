use std::{path::PathBuf, time::Duration};

use futures::{
    future::LocalBoxFuture,
    stream::{self, LocalBoxStream},
    FutureExt, StreamExt,
};
use hazardwatch::location::{LocationError, LocationSource, Position};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader, Lines},
};
use tracing::warn;

/// Replays a recorded track: one JSON position per line, emitted at a fixed
/// pace.
#[derive(Debug, Clone)]
pub struct TrackFile {
    path: PathBuf,
    pace: Duration,
}

impl TrackFile {
    pub fn new(path: impl Into<PathBuf>, pace: Duration) -> Self {
        Self {
            path: path.into(),
            pace,
        }
    }
}

struct Replay {
    lines: Lines<BufReader<File>>,
    pace: Duration,
    line: usize,
    failed: bool,
}

async fn next_fix(mut replay: Replay) -> Option<(Result<Position, LocationError>, Replay)> {
    if replay.failed {
        return None;
    }

    loop {
        let line = match replay.lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return None,
            Err(e) => {
                replay.failed = true;
                return Some((Err(e.into()), replay));
            }
        };
        replay.line += 1;

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str(&line) {
            Ok(position) => {
                tokio::time::sleep(replay.pace).await;
                return Some((Ok(position), replay));
            }
            Err(e) => warn!(line = replay.line, "skipping malformed fix: {e}"),
        }
    }
}

impl LocationSource for TrackFile {
    type Stream = LocalBoxStream<'static, Result<Position, LocationError>>;

    fn connect(&self) -> LocalBoxFuture<'static, Result<Self::Stream, LocationError>> {
        let path = self.path.clone();
        let pace = self.pace;

        async move {
            let file = File::open(&path).await.map_err(|e| {
                LocationError::DeviceUnavailable(format!("{}: {e}", path.display()))
            })?;
            let replay = Replay {
                lines: BufReader::new(file).lines(),
                pace,
                line: 0,
                failed: false,
            };

            Ok(stream::unfold(replay, next_fix).boxed_local())
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use hazardwatch::location::LocationSource;

    use super::TrackFile;

    #[tokio::test]
    async fn replays_and_skips_garbage() {
        let path = std::env::temp_dir().join(format!("hazardalert-track-{}.jsonl", std::process::id()));
        std::fs::write(
            &path,
            concat!(
                "{\"lat\":58.1,\"lng\":8.0,\"timestamp\":1717236000000}\n",
                "\n",
                "not json\n",
                "{\"lat\":58.2,\"lng\":8.0,\"speed\":13.9,\"timestamp\":1717236001000}\n",
            ),
        )
        .unwrap();

        let stream = TrackFile::new(&path, Duration::ZERO).connect().await.unwrap();
        let fixes: Vec<_> = stream.map(Result::unwrap).collect().await;

        assert_eq!(fixes.len(), 2);
        assert_eq!(fixes[1].speed, Some(13.9));
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let opened = TrackFile::new("/nonexistent/track.jsonl", Duration::ZERO)
            .connect()
            .await;
        let Err(err) = opened else {
            panic!("opened a missing track");
        };
        assert!(!err.is_retryable());
    }
}
