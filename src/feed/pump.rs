//! Drive a `FeedHub` from an external source.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::{Stream, StreamExt};

use crate::error::FeedError;
use crate::event::ChangeEvent;

use super::hub::FeedHub;

/// Forward a stream of change events into the hub until it ends or fails.
///
/// `Malformed` items are logged and skipped. Any other error is emitted as a
/// feed error and terminates the hub. Returns the number of forwarded events.
pub async fn pump<S>(hub: &FeedHub, stream: S) -> Result<u64, FeedError>
where
    S: Stream<Item = Result<ChangeEvent, FeedError>>,
{
    tokio::pin!(stream);
    let mut forwarded = 0u64;

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                hub.emit_change(event).await?;
                forwarded += 1;
            }
            Err(FeedError::Malformed(reason)) => {
                tracing::warn!(%reason, "skipping malformed change event");
            }
            Err(err) => {
                tracing::error!(error = %err, forwarded, "change feed failed");
                hub.emit_error(err.to_string()).await?;
                return Err(err);
            }
        }
    }

    tracing::info!(forwarded, "change feed ended");
    hub.emit_end().await?;
    Ok(forwarded)
}

/// Parse newline-delimited JSON change events. Blank lines are ignored.
pub fn ndjson_events<R>(reader: R) -> impl Stream<Item = Result<ChangeEvent, FeedError>>
where
    R: AsyncRead,
{
    LinesStream::new(BufReader::new(reader).lines()).filter_map(|line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(
            serde_json::from_str::<ChangeEvent>(&line)
                .map_err(|e| FeedError::Malformed(e.to_string())),
        ),
        Err(e) => Some(Err(FeedError::Source(e.to_string()))),
    })
}
