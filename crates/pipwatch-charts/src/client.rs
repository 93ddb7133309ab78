use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use pipwatch_core::config::ChartsConfig;
use pipwatch_core::ports::{ChartError, ChartRenderer};
use pipwatch_core::types::ChartStyle;

/// HTTP client for the chart-rendering service.
///
/// The service answers `POST /render` with raw PNG bytes. No timeout is set
/// on the client itself; every render call is bounded by the caller's
/// deadline.
pub struct HttpChartRenderer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChartRenderer {
    pub fn new(config: &ChartsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Wire format of a render request.
#[derive(Serialize)]
struct RenderRequest<'a> {
    currency: &'a str,
    event_time: DateTime<Utc>,
    window_hours: u32,
    style: ChartStyle,
}

#[async_trait]
impl ChartRenderer for HttpChartRenderer {
    async fn render(
        &self,
        currency: &str,
        event_instant: DateTime<Utc>,
        window_hours: u32,
        style: ChartStyle,
    ) -> Result<Vec<u8>, ChartError> {
        let url = format!("{}/render", self.base_url);
        let body = RenderRequest {
            currency,
            event_time: event_instant,
            window_hours,
            style,
        };

        debug!(%currency, %style, window_hours, "requesting chart render");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChartError::Unavailable(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status, body = %message, "chart service refused the render");
            return Err(ChartError::Render { status, message });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ChartError::Unavailable(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ChartError::Empty);
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// One-shot HTTP server: accepts a single connection, drains the
    /// request, answers with the canned response and closes.
    async fn serve_once(status_line: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_request(&mut sock).await;
            let head = format!(
                "{status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(&body).await.unwrap();
            sock.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    /// Read headers plus the content-length body so the client never sees
    /// a reset while still writing.
    async fn read_request(sock: &mut TcpStream) {
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            seen.extend_from_slice(&buf[..n]);
            if let Some(end) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&seen[..end]).to_lowercase();
                let body_len = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if seen.len() >= end + 4 + body_len {
                    return;
                }
            }
        }
    }

    fn renderer(base_url: String) -> HttpChartRenderer {
        HttpChartRenderer {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn event_instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 13, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn successful_render_returns_the_image_bytes() {
        let base = serve_once("HTTP/1.1 200 OK", b"\x89PNG fake".to_vec()).await;
        let out = renderer(base)
            .render("USD", event_instant(), 2, ChartStyle::Single)
            .await
            .unwrap();
        assert_eq!(out, b"\x89PNG fake");
    }

    #[tokio::test]
    async fn service_errors_carry_status_and_body() {
        let base = serve_once("HTTP/1.1 502 Bad Gateway", b"price feed down".to_vec()).await;
        let err = renderer(base)
            .render("EUR", event_instant(), 2, ChartStyle::Multi)
            .await
            .unwrap_err();
        match err {
            ChartError::Render { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "price feed down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_success_body_is_reported_as_empty() {
        let base = serve_once("HTTP/1.1 200 OK", Vec::new()).await;
        let err = renderer(base)
            .render("USD", event_instant(), 2, ChartStyle::Single)
            .await
            .unwrap_err();
        assert!(matches!(err, ChartError::Empty));
    }

    #[tokio::test]
    async fn unreachable_service_maps_to_unavailable() {
        // discard port; nothing listens there
        let err = renderer("http://127.0.0.1:9".to_string())
            .render("USD", event_instant(), 2, ChartStyle::Single)
            .await
            .unwrap_err();
        assert!(matches!(err, ChartError::Unavailable(_)));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let cfg = ChartsConfig {
            base_url: "http://charts:8080/".to_string(),
            ..ChartsConfig::default()
        };
        assert_eq!(HttpChartRenderer::new(&cfg).base_url, "http://charts:8080");
    }

    #[test]
    fn request_body_uses_the_wire_names() {
        let body = RenderRequest {
            currency: "USD",
            event_time: event_instant(),
            window_hours: 2,
            style: ChartStyle::Multi,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["currency"], "USD");
        assert_eq!(v["window_hours"], 2);
        assert_eq!(v["style"], "multi");
        let ts = v["event_time"].as_str().unwrap();
        assert!(ts.starts_with("2026-01-15T13:30:00"));
    }
}
