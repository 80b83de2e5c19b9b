// Client for the remote text-to-image service, plus the worker that keeps the
// request off the UI thread.
// Visual expectation: press G, keep moving; a second or two later the new overlay
// pops onto your face (or the placeholder plus a notice if the service refused).

use crate::config::GenerationConfig;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use image::RgbaImage;
use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Identifies one press of the generate key; newer ids supersede older ones.
pub type RequestId = u64;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("network error: {0}")]
    Network(String),
    #[error("service answered HTTP {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("service reported failure: {0}")]
    ServerFailure(String),
    #[error("response carried no image")]
    MissingOutput,
    #[error("image could not be decoded: {0}")]
    Decode(String),
}

/// JSON body POSTed to the service.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub aspect_ratio: &'a str,
    pub output_format: &'a str,
    pub sync_mode: bool,
}

// Two response families are accepted:
//   {"images": [{"url": ".."}]}
//   {"status": "succeeded", "output": ".." | [".."], "error": null}
#[derive(Debug, Default, Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    output: Option<OutputField>,
    #[serde(default)]
    images: Vec<ImageRef>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OutputField {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    url: String,
}

/// Pull the produced image URL out of a response body.
pub fn parse_response(body: &str) -> Result<String, GenerationError> {
    let resp: GenerationResponse =
        serde_json::from_str(body).map_err(|e| GenerationError::Malformed(e.to_string()))?;

    if let Some(status) = resp.status.as_deref() {
        if matches!(status, "failed" | "canceled" | "error") {
            let detail = resp.error.as_ref().map(error_text).unwrap_or_else(|| status.to_string());
            return Err(GenerationError::ServerFailure(detail));
        }
    }
    if let Some(err) = resp.error.as_ref() {
        return Err(GenerationError::ServerFailure(error_text(err)));
    }

    let url = resp
        .images
        .into_iter()
        .map(|img| img.url)
        .next()
        .or(match resp.output {
            Some(OutputField::One(url)) => Some(url),
            Some(OutputField::Many(urls)) => urls.into_iter().next(),
            None => None,
        });

    match url {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Err(GenerationError::MissingOutput),
    }
}

fn error_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Inline payload of a `data:<mime>;base64,<payload>` URL.
fn decode_data_url(url: &str) -> Result<Vec<u8>, GenerationError> {
    let (meta, payload) = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .ok_or_else(|| GenerationError::Decode("bad data URL".into()))?;
    if !meta.ends_with(";base64") {
        return Err(GenerationError::Decode("data URL is not base64".into()));
    }
    BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| GenerationError::Decode(e.to_string()))
}

/// The two calls the app makes against the outside world.
pub trait ImageGenerator {
    /// Ask for an image; returns the URL of the result.
    fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
    /// Download the encoded image behind `url`.
    fn fetch(&self, url: &str) -> Result<Vec<u8>, GenerationError>;
}

pub struct HttpImageGenerator {
    client: Client,
    endpoint: String,
    authorization: Option<String>,
    aspect_ratio: String,
    output_format: String,
    sync_mode: bool,
}

impl HttpImageGenerator {
    /// Client keyed from the environment variable named by `api_key_env`.
    pub fn new(cfg: &GenerationConfig) -> Result<Self, GenerationError> {
        let key = std::env::var(&cfg.api_key_env).ok().filter(|k| !k.is_empty());
        if key.is_none() {
            log::warn!("{} is not set; generation requests go out unauthenticated", cfg.api_key_env);
        }
        Self::with_api_key(cfg, key.as_deref())
    }

    pub fn with_api_key(cfg: &GenerationConfig, key: Option<&str>) -> Result<Self, GenerationError> {
        // No client-side timeout: a slow generation is waited out, never cut short.
        let client = Client::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        let authorization = key.map(|k| format!("{} {k}", cfg.auth_scheme));

        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            authorization,
            aspect_ratio: cfg.aspect_ratio.clone(),
            output_format: cfg.output_format.clone(),
            sync_mode: cfg.sync_mode,
        })
    }
}

impl ImageGenerator for HttpImageGenerator {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = GenerationRequest {
            prompt,
            aspect_ratio: &self.aspect_ratio,
            output_format: &self.output_format,
            sync_mode: self.sync_mode,
        };
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(auth) = &self.authorization {
            req = req.header(AUTHORIZATION, auth);
        }

        let resp = req.send().map_err(|e| GenerationError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GenerationError::Status(status.as_u16()));
        }
        let text = resp.text().map_err(|e| GenerationError::Network(e.to_string()))?;
        parse_response(&text)
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>, GenerationError> {
        if url.starts_with("data:") {
            return decode_data_url(url);
        }
        let resp = self.client.get(url).send().map_err(|e| GenerationError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GenerationError::Status(status.as_u16()));
        }
        let bytes = resp.bytes().map_err(|e| GenerationError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// How one generation request ended.
#[derive(Debug)]
pub enum GenerationOutcome {
    /// Image produced, downloaded and fully decoded.
    Ready { url: String, image: RgbaImage },
    /// The service call itself failed (transport, status, payload).
    RequestFailed(GenerationError),
    /// The service produced a URL but the image behind it could not be loaded.
    ImageUnavailable { url: String, error: GenerationError },
}

/// generate → fetch → decode, all in one go. Runs on a worker thread.
pub fn run_generation(generator: &dyn ImageGenerator, prompt: &str) -> GenerationOutcome {
    let url = match generator.generate(prompt) {
        Ok(url) => url,
        Err(e) => return GenerationOutcome::RequestFailed(e),
    };
    let bytes = match generator.fetch(&url) {
        Ok(b) => b,
        Err(error) => return GenerationOutcome::ImageUnavailable { url, error },
    };
    match image::load_from_memory(&bytes) {
        Ok(img) => GenerationOutcome::Ready { url, image: img.to_rgba8() },
        Err(e) => GenerationOutcome::ImageUnavailable {
            url,
            error: GenerationError::Decode(e.to_string()),
        },
    }
}

/// Runs requests on short-lived threads and hands finished outcomes back to the UI thread.
pub struct GenerationWorker<G> {
    generator: Arc<G>,
    tx: Sender<(RequestId, GenerationOutcome)>,
    rx: Receiver<(RequestId, GenerationOutcome)>,
}

impl<G: ImageGenerator + Send + Sync + 'static> GenerationWorker<G> {
    pub fn new(generator: G) -> Self {
        let (tx, rx) = mpsc::channel();
        Self { generator: Arc::new(generator), tx, rx }
    }

    /// Start a request in the background. The outcome shows up in a later `poll`.
    pub fn request(&self, id: RequestId, prompt: String) {
        let generator = Arc::clone(&self.generator);
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("generation-{id}"))
            .spawn(move || {
                let outcome = run_generation(&*generator, &prompt);
                // The receiver is gone once the window closed; nothing left to deliver to.
                let _ = tx.send((id, outcome));
            });
        if let Err(e) = spawned {
            log::error!("could not start generation thread: {e}");
            let _ = self
                .tx
                .send((id, GenerationOutcome::RequestFailed(GenerationError::Network(e.to_string()))));
        }
    }

    /// Everything that finished since the last call. Never blocks.
    pub fn poll(&self) -> Vec<(RequestId, GenerationOutcome)> {
        self.rx.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use image::{ImageFormat, Rgba};
    use std::io::{Cursor, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::JoinHandle;
    use std::time::Instant;

    fn png_bytes() -> Vec<u8> {
        let img = RgbaImage::from_pixel(3, 2, Rgba([0, 255, 0, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).expect("encode");
        bytes
    }

    struct FakeGenerator {
        url: Result<&'static str, u16>,
        body: Option<Vec<u8>>,
    }

    impl ImageGenerator for FakeGenerator {
        fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            self.url.map(str::to_string).map_err(GenerationError::Status)
        }
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, GenerationError> {
            self.body.clone().ok_or(GenerationError::Status(404))
        }
    }

    type Canned = (u16, &'static str, Vec<u8>);

    /// Reads one HTTP/1.1 request (head plus Content-Length body) off the socket.
    fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut wanted = None;
        loop {
            if wanted.is_none() {
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                    let body_len = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    wanted = Some(end + 4 + body_len);
                }
            }
            if wanted.is_some_and(|total| buf.len() >= total) {
                break;
            }
            let n = stream.read(&mut chunk).expect("read request");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Local server answering one connection per canned response, in order.
    /// `responses` gets the server's base URL so bodies can link back to it.
    /// Joining the handle yields the raw requests it saw.
    fn serve(responses: impl FnOnce(&str) -> Vec<Canned>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let responses = responses(&base);
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, content_type, body) in responses {
                let (mut stream, _) = listener.accept().expect("accept");
                seen.push(read_request(&mut stream));
                let head = format!(
                    "HTTP/1.1 {status} Canned\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                stream.write_all(head.as_bytes()).expect("write head");
                stream.write_all(&body).expect("write body");
            }
            seen
        });
        (base, handle)
    }

    fn http_generator(base: &str, key: Option<&str>) -> HttpImageGenerator {
        let cfg = GenerationConfig { endpoint: format!("{base}/generate"), ..GenerationConfig::default() };
        HttpImageGenerator::with_api_key(&cfg, key).expect("client")
    }

    #[test]
    fn http_error_status_fails_the_request() {
        let (base, server) = serve(|_| vec![(500, "text/plain", b"upstream exploded".to_vec())]);
        let generator = http_generator(&base, Some("secret-1"));

        assert!(matches!(
            run_generation(&generator, "wizard hat"),
            GenerationOutcome::RequestFailed(GenerationError::Status(500))
        ));
        assert_eq!(server.join().expect("server").len(), 1);
    }

    #[test]
    fn http_generate_then_fetch_yields_image() {
        let (base, server) = serve(|base| {
            let body = format!(r#"{{"images":[{{"url":"{base}/out/hat.png"}}]}}"#);
            vec![(200, "application/json", body.into_bytes()), (200, "image/png", png_bytes())]
        });
        let generator = http_generator(&base, Some("secret-2"));

        match run_generation(&generator, "wizard hat") {
            GenerationOutcome::Ready { url, image } => {
                assert_eq!(url, format!("{base}/out/hat.png"));
                assert_eq!(image.dimensions(), (3, 2));
            }
            other => panic!("unexpected {other:?}"),
        }

        let seen = server.join().expect("server");
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("POST /generate "));
        assert!(seen[0].to_ascii_lowercase().contains("authorization: key secret-2\r\n"));
        assert!(seen[0].contains(r#""prompt":"wizard hat""#));
        assert!(seen[0].contains(r#""sync_mode":true"#));
        assert!(seen[1].starts_with("GET /out/hat.png "));
    }

    #[test]
    fn http_without_key_sends_no_authorization() {
        let (base, server) = serve(|_| vec![(200, "application/json", br#"{"images":[]}"#.to_vec())]);
        let generator = http_generator(&base, None);

        assert!(matches!(
            run_generation(&generator, "wizard hat"),
            GenerationOutcome::RequestFailed(GenerationError::MissingOutput)
        ));
        let seen = server.join().expect("server");
        assert!(!seen[0].to_ascii_lowercase().contains("authorization:"));
    }

    #[test]
    fn http_inline_data_url_skips_the_download() {
        let (base, server) = serve(|_| {
            let url = format!("data:image/png;base64,{}", BASE64_STANDARD.encode(png_bytes()));
            let body = serde_json::json!({ "status": "succeeded", "output": [url] }).to_string();
            vec![(200, "application/json", body.into_bytes())]
        });
        let generator = http_generator(&base, Some("secret-3"));

        assert!(matches!(
            run_generation(&generator, "crown"),
            GenerationOutcome::Ready { ref image, .. } if image.dimensions() == (3, 2)
        ));
        // only the generate call reached the network
        assert_eq!(server.join().expect("server").len(), 1);
    }

    #[test]
    fn http_missing_image_is_unavailable_not_failed() {
        let (base, server) = serve(|base| {
            let body = format!(r#"{{"images":[{{"url":"{base}/gone.png"}}]}}"#);
            vec![(200, "application/json", body.into_bytes()), (404, "text/plain", b"nope".to_vec())]
        });
        let generator = http_generator(&base, Some("secret-4"));

        assert!(matches!(
            run_generation(&generator, "crown"),
            GenerationOutcome::ImageUnavailable { error: GenerationError::Status(404), .. }
        ));
        assert_eq!(server.join().expect("server").len(), 2);
    }

    #[test]
    fn request_body_shape() {
        let body = GenerationRequest {
            prompt: "wizard hat",
            aspect_ratio: "1:1",
            output_format: "png",
            sync_mode: true,
        };
        let v = serde_json::to_value(&body).expect("json");
        assert_eq!(
            v,
            serde_json::json!({
                "prompt": "wizard hat",
                "aspect_ratio": "1:1",
                "output_format": "png",
                "sync_mode": true
            })
        );
    }

    #[test]
    fn parses_images_array() {
        let url = parse_response(r#"{"images":[{"url":"https://x/a.png","width":1024}],"seed":7}"#)
            .expect("url");
        assert_eq!(url, "https://x/a.png");
    }

    #[test]
    fn parses_output_string_and_list() {
        assert_eq!(
            parse_response(r#"{"status":"succeeded","output":"https://x/b.webp"}"#).expect("url"),
            "https://x/b.webp"
        );
        assert_eq!(
            parse_response(r#"{"status":"succeeded","output":["https://x/c.png","https://x/d.png"],"error":null}"#)
                .expect("url"),
            "https://x/c.png"
        );
    }

    #[test]
    fn failure_shapes() {
        assert!(matches!(parse_response("<html>oops"), Err(GenerationError::Malformed(_))));
        assert!(matches!(
            parse_response(r#"{"status":"failed","error":"NSFW"}"#),
            Err(GenerationError::ServerFailure(msg)) if msg == "NSFW"
        ));
        assert!(matches!(
            parse_response(r#"{"error":{"code":500}}"#),
            Err(GenerationError::ServerFailure(_))
        ));
        assert!(matches!(parse_response(r#"{"images":[]}"#), Err(GenerationError::MissingOutput)));
        assert!(matches!(
            parse_response(r#"{"status":"succeeded","output":[]}"#),
            Err(GenerationError::MissingOutput)
        ));
        assert!(matches!(parse_response(r#"{"output":"  "}"#), Err(GenerationError::MissingOutput)));
    }

    #[test]
    fn data_urls_decode_inline() {
        let png = png_bytes();
        let url = format!("data:image/png;base64,{}", BASE64_STANDARD.encode(&png));
        assert_eq!(decode_data_url(&url).expect("decode"), png);
        assert!(decode_data_url("data:image/png,rawbytes").is_err());
        assert!(decode_data_url("data:nocomma").is_err());
    }

    #[test]
    fn run_generation_maps_each_stage() {
        let ok = FakeGenerator { url: Ok("https://x/a.png"), body: Some(png_bytes()) };
        match run_generation(&ok, "hat") {
            GenerationOutcome::Ready { url, image } => {
                assert_eq!(url, "https://x/a.png");
                assert_eq!(image.dimensions(), (3, 2));
            }
            other => panic!("unexpected {other:?}"),
        }

        let refused = FakeGenerator { url: Err(503), body: None };
        assert!(matches!(
            run_generation(&refused, "hat"),
            GenerationOutcome::RequestFailed(GenerationError::Status(503))
        ));

        let gone = FakeGenerator { url: Ok("https://x/a.png"), body: None };
        assert!(matches!(run_generation(&gone, "hat"), GenerationOutcome::ImageUnavailable { .. }));

        let garbage = FakeGenerator { url: Ok("https://x/a.png"), body: Some(b"not an image".to_vec()) };
        assert!(matches!(
            run_generation(&garbage, "hat"),
            GenerationOutcome::ImageUnavailable { error: GenerationError::Decode(_), .. }
        ));
    }

    #[test]
    fn worker_delivers_outcome_with_its_id() {
        let worker = GenerationWorker::new(FakeGenerator { url: Err(500), body: None });
        worker.request(7, "hat".into());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut got = Vec::new();
        while got.is_empty() && Instant::now() < deadline {
            got = worker.poll();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 7);
        assert!(matches!(got[0].1, GenerationOutcome::RequestFailed(GenerationError::Status(500))));
    }
}
