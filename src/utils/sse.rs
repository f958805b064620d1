//! Minimal server-sent-events reader for upstream response bodies.
//!
//! Only `data:` fields matter for the upstream APIs the gateway talks to.
//! Multi-line data is joined with `\n`, a `[DONE]` sentinel terminates the
//! stream, and everything else (comments, event names, ids) is skipped.

use futures_util::stream::{self, BoxStream};
use futures_util::TryStreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{GatewayError, Result};

/// Upper bound on one decoded event. Chat deltas are tiny; anything close
/// to this is a protocol violation, not a large completion.
const MAX_EVENT_BYTES: usize = 1024 * 1024;

async fn next_data_event<R>(reader: &mut R, buffer: &mut String) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buffer.clear();
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await.map_err(|err| {
            GatewayError::InvalidResponse(format!("failed to read event stream: {err}"))
        })?;
        if read == 0 {
            if buffer.is_empty() || buffer == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if buffer.is_empty() {
                continue;
            }
            if buffer == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        if let Some(rest) = trimmed.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            if buffer.len() + rest.len() + 1 > MAX_EVENT_BYTES {
                return Err(GatewayError::InvalidResponse(format!(
                    "event stream entry exceeds {MAX_EVENT_BYTES} bytes"
                )));
            }
            if !buffer.is_empty() {
                buffer.push('\n');
            }
            buffer.push_str(rest);
        }
    }
}

/// Decode the `data:` payloads of an SSE reader as a stream of strings.
pub fn data_event_stream_from_reader<R>(reader: R) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    Box::pin(stream::unfold(
        (reader, String::new(), false),
        |(mut reader, mut buffer, failed)| async move {
            if failed {
                return None;
            }
            match next_data_event(&mut reader, &mut buffer).await {
                Ok(Some(event)) => Some((Ok(event), (reader, buffer, false))),
                Ok(None) => None,
                Err(err) => Some((Err(err), (reader, buffer, true))),
            }
        },
    ))
}

/// Decode the `data:` payloads of an upstream SSE response body.
pub fn data_event_stream(response: reqwest::Response) -> BoxStream<'static, Result<String>> {
    let bytes = response
        .bytes_stream()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
    data_event_stream_from_reader(StreamReader::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn collect(input: &'static [u8]) -> Vec<String> {
        data_event_stream_from_reader(input)
            .map(|event| event.expect("event"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn splits_events_on_blank_lines() {
        let events = collect(b"data: one\n\ndata: two\n\n").await;
        assert_eq!(events, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn joins_multi_line_data() {
        let events = collect(b"data: a\ndata: b\n\n").await;
        assert_eq!(events, vec!["a\nb".to_string()]);
    }

    #[tokio::test]
    async fn done_sentinel_terminates() {
        let events = collect(b"data: one\n\ndata: [DONE]\n\ndata: late\n\n").await;
        assert_eq!(events, vec!["one".to_string()]);
    }

    #[tokio::test]
    async fn ignores_comments_and_event_names() {
        let events = collect(b": keepalive\nevent: message\ndata: payload\n\n").await;
        assert_eq!(events, vec!["payload".to_string()]);
    }

    #[tokio::test]
    async fn flushes_trailing_event_without_blank_line() {
        let events = collect(b"data: tail").await;
        assert_eq!(events, vec!["tail".to_string()]);
    }
}
