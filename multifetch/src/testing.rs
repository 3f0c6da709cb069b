//! Mock mirrors shared by the test modules.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use url::Url;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serve `data` like a static file server supporting single byte ranges.
pub struct RangeResponder {
    data: Arc<Vec<u8>>,
    max_delay: Option<Duration>,
}

impl RangeResponder {
    fn template(&self, status: u16) -> ResponseTemplate {
        let template = ResponseTemplate::new(status);

        match self.max_delay {
            Some(max) if !max.is_zero() => template.set_delay(rand::rng().random_range(Duration::ZERO..max)),
            _ => template,
        }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let length = self.data.len() as u64;

        if request.method.as_str() == "HEAD" {
            return self
                .template(200)
                .insert_header("content-length", length.to_string())
                .insert_header("etag", "\"mock-etag\"");
        }

        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes="))
            .and_then(|value| value.split_once('-'))
            .and_then(|(first, last)| Some((first.parse::<u64>().ok()?, last.parse::<u64>().ok()?)));

        match range {
            Some((first, last)) if first <= last && last < length => self
                .template(206)
                .insert_header("content-range", format!("bytes {first}-{last}/{length}"))
                .set_body_bytes(self.data[first as usize..=last as usize].to_vec()),
            Some(_) => self.template(416),
            None => self.template(200).set_body_bytes(self.data.to_vec()),
        }
    }
}

/// Start a mirror serving `data`, delaying each response by a random duration up to `max_delay`.
pub async fn mirror(data: Arc<Vec<u8>>, max_delay: Option<Duration>) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(any())
        .respond_with(RangeResponder { data, max_delay })
        .mount(&server)
        .await;

    server
}

/// Start a mirror answering every request with `status`.
pub async fn broken_mirror(status: u16) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(any()).respond_with(ResponseTemplate::new(status)).mount(&server).await;

    server
}

/// URL of a local port nothing listens on.
pub fn closed_mirror() -> Url {
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

    Url::parse(&format!("http://127.0.0.1:{port}/file.bin")).unwrap()
}

/// URL of `path` on a mock mirror.
pub fn url(server: &MockServer, path: &str) -> Url {
    Url::parse(&server.uri()).unwrap().join(path).unwrap()
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0; len];
    rand::rng().fill(&mut data[..]);
    data
}
