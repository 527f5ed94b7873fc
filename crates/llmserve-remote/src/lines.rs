use futures::{Stream, StreamExt};

/// Re-frames a byte stream into lines without the trailing `\n` / `\r\n`.
/// A final unterminated line is still yielded.
pub fn lines<S, B, E>(body: S) -> impl Stream<Item = Result<String, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    async_stream::try_stream! {
        let mut buf: Vec<u8> = Vec::new();
        futures::pin_mut!(body);
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(chunk?.as_ref());
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                yield decode(&line);
            }
        }
        if !buf.is_empty() {
            yield decode(&buf);
        }
    }
}

fn decode(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches(&['\n', '\r'][..]).to_string()
}
