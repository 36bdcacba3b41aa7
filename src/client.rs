use crate::protocol::{ChatRequestBody, Envelope, StreamEvent};
use crate::utf8::Utf8Decoder;
use futures::StreamExt;
use reqwest::{Client as HttpClient, StatusCode};
use std::future::Future;
use thiserror::Error;

pub struct ClientConfig {
    pub base_url: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("server rejected the request ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("stream ended without a close or error event")]
    Truncated,
}

type ClientResult<T> = Result<T, ClientError>;

pub struct ChatClient {
    base_url: String,
    http: HttpClient,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            http: HttpClient::new(),
        }
    }

    /// Submits `body` and feeds every output chunk to `on_output`. Resolves
    /// with the terminal event.
    pub async fn stream_chat<F, Fut>(
        &self,
        body: &ChatRequestBody,
        mut on_output: F,
    ) -> ClientResult<StreamEvent>
    where
        F: FnMut(StreamEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::Rejected {
                status,
                message: rejection_message(&text),
            });
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for data in decoder.push(&chunk) {
                let Ok(event) = serde_json::from_str::<StreamEvent>(&data) else {
                    continue;
                };
                if event.is_terminal() {
                    return Ok(event);
                }
                on_output(event).await;
            }
        }

        Err(ClientError::Truncated)
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

fn rejection_message(body: &str) -> String {
    let Ok(envelope) = serde_json::from_str::<Envelope>(body) else {
        return body.to_string();
    };

    let mut message = envelope.error.unwrap_or_default();
    for issue in envelope.details {
        if issue.path.is_empty() {
            message.push_str(&format!("; {}", issue.message));
        } else {
            message.push_str(&format!("; {}: {}", issue.path, issue.message));
        }
    }
    message
}

/// Splits an SSE byte stream into the `data` payloads of complete events.
/// Characters split across network reads are reassembled before framing.
#[derive(Default)]
struct SseDecoder {
    utf8: Utf8Decoder,
    buffer: String,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let chunk = self.utf8.push(bytes);
        if chunk.contains('\r') {
            self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(&chunk);
        }

        let mut payloads = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let raw_event = self.buffer[..idx].to_string();
            self.buffer.drain(..idx + 2);

            if let Some(data) = extract_sse_data(&raw_event) {
                payloads.push(data);
            }
        }
        payloads
    }
}

fn extract_sse_data(raw: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ProcessBridge;
    use crate::resolver::{CommandResolver, ResolvedCommand};
    use crate::server;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    async fn serve(command: ResolvedCommand) -> String {
        let resolver = Arc::new(CommandResolver::fixed(command));
        let bridge = ProcessBridge::new(resolver, "GEMINI_API_KEY");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::serve(listener, bridge, CancellationToken::new()));
        format!("http://{addr}/")
    }

    fn shell(script: &str) -> ResolvedCommand {
        ResolvedCommand::new(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string(), "tool".to_string()],
        )
    }

    fn body(prompt: &str) -> ChatRequestBody {
        ChatRequestBody {
            prompt: prompt.to_string(),
            ..ChatRequestBody::default()
        }
    }

    #[test]
    fn decoder_joins_events_split_across_chunks() {
        let mut decoder = SseDecoder::default();

        assert!(decoder.push(b"data: {\"type\":\"std").is_empty());
        let payloads = decoder.push(b"out\",\"content\":\"hi\"}\n\n: keep-alive\n\n");

        assert_eq!(payloads, vec![r#"{"type":"stdout","content":"hi"}"#]);
    }

    #[test]
    fn decoder_accepts_crlf_framing() {
        let mut decoder = SseDecoder::default();
        let payloads = decoder.push(b"data: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(payloads, vec!["a", "b"]);
    }

    #[test]
    fn decoder_reassembles_characters_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let frame = "data: {\"type\":\"stdout\",\"content\":\"café\"}\n\n".as_bytes();
        let split = frame.iter().position(|&byte| byte == 0xc3).unwrap() + 1;

        assert!(decoder.push(&frame[..split]).is_empty());
        let payloads = decoder.push(&frame[split..]);

        assert_eq!(payloads, vec![r#"{"type":"stdout","content":"café"}"#]);
    }

    #[test]
    fn rejection_message_lists_validation_details() {
        let message = rejection_message(
            r#"{"success":false,"error":"Validation error","details":[{"path":"prompt","message":"Required"}],"timestamp":"2026-01-01T00:00:00.000Z"}"#,
        );
        assert_eq!(message, "Validation error; prompt: Required");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relays_output_until_close() {
        let base_url = serve(shell("printf one; printf two >&2; exit 4")).await;
        let client = ChatClient::new(ClientConfig { base_url });
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let terminal = client
            .stream_chat(&body("list files"), move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(event);
                }
            })
            .await
            .unwrap();

        assert_eq!(terminal, StreamEvent::Close(4));
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&StreamEvent::Stdout("one".into())));
        assert!(seen.contains(&StreamEvent::Stderr("two".into())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn validation_failure_is_reported_before_streaming() {
        let base_url = serve(ResolvedCommand::new("/nonexistent/cli-bridge-tool", Vec::new())).await;
        let client = ChatClient::new(ClientConfig { base_url });

        let result = client.stream_chat(&body(""), |_| async {}).await;

        match result {
            Err(ClientError::Rejected { status, message }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert!(message.starts_with("Validation error"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnecting_kills_the_process() {
        let base_url = serve(shell("echo $$; exec sleep 30")).await;
        let response = HttpClient::new()
            .post(format!("{base_url}api/chat"))
            .json(&body("hi"))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let pid: libc::pid_t = loop {
            let chunk = stream.next().await.unwrap().unwrap();
            let payloads = decoder.push(&chunk);
            if let Some(data) = payloads.first() {
                match serde_json::from_str::<StreamEvent>(data).unwrap() {
                    StreamEvent::Stdout(line) => break line.trim().parse().unwrap(),
                    other => panic!("unexpected event {other:?}"),
                }
            }
        };

        drop(stream);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(25);
        while unsafe { libc::kill(pid, 0) } == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "process {pid} survived the disconnect"
            );
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}
