use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reverse_prompt::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What a scripted call returns.
#[derive(Debug, Clone)]
pub enum Step {
    Caption(&'static str),
    Transient,
    Permanent,
}

/// Captioner driven by a per-image script.
///
/// Images are identified by their file contents, which [`image_dir`] sets to
/// the image id. Once an image's script runs out every call succeeds.
#[derive(Default)]
pub struct ScriptedCaptioner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, u32>>,
    cancel_on_call: Option<(u32, Arc<AtomicBool>)>,
}

impl ScriptedCaptioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, id: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(id.to_string(), steps.into());
        self
    }

    /// Raise `flag` during the `n`th call overall, as a Ctrl-C would.
    pub fn cancel_on_call(mut self, n: u32, flag: Arc<AtomicBool>) -> Self {
        self.cancel_on_call = Some((n, flag));
        self
    }

    pub fn calls_for(&self, id: &str) -> u32 {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

impl Captioner for ScriptedCaptioner {
    async fn caption(&self, image: &ImagePayload) -> Result<String, CaptionError> {
        let id = String::from_utf8_lossy(&image.bytes).to_string();
        let total = {
            let mut calls = self.calls.lock().unwrap();
            *calls.entry(id.clone()).or_insert(0) += 1;
            calls.values().sum::<u32>()
        };
        if let Some((n, flag)) = &self.cancel_on_call {
            if total == *n {
                flag.store(true, Ordering::SeqCst);
            }
        }

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(|s| s.pop_front());
        match step {
            Some(Step::Caption(text)) => Ok(text.to_string()),
            Some(Step::Transient) => Err(CaptionError::Http {
                status: 503,
                body: "overloaded".into(),
            }),
            Some(Step::Permanent) => Err(CaptionError::Http {
                status: 400,
                body: "bad image".into(),
            }),
            None => Ok(format!("Caption for {id}.")),
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// Store that accepts `ok_writes` records and then fails every write.
pub struct FailingStore {
    pub ok_writes: usize,
    pub written: Vec<ProgressEntry>,
    path: PathBuf,
}

impl FailingStore {
    pub fn new(ok_writes: usize) -> Self {
        Self {
            ok_writes,
            written: Vec::new(),
            path: PathBuf::from("failing-store"),
        }
    }
}

impl ProgressStore for FailingStore {
    fn load(&self) -> Result<Vec<ProgressEntry>, StoreError> {
        Ok(self.written.clone())
    }

    fn record(&mut self, entry: &ProgressEntry) -> Result<(), StoreError> {
        if self.written.len() >= self.ok_writes {
            return Err(StoreError::Io {
                path: self.path.clone(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.written.push(entry.clone());
        Ok(())
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

/// A temp dir holding one file per id, each containing its own id.
pub fn image_dir(ids: &[&str]) -> (tempfile::TempDir, Vec<ImageRecord>) {
    let dir = tempfile::tempdir().unwrap();
    for id in ids {
        let path = dir.path().join(id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, id.as_bytes()).unwrap();
    }
    let records = ImageSource::directory(dir.path()).discover().unwrap();
    (dir, records)
}

/// Defaults with pacing off; backoff sleeps still happen on the paused clock.
pub fn fast_config() -> BatchConfig {
    BatchConfig::builder().with_pace(Duration::ZERO).build()
}

/// Local HTTP server answering one canned `(status, body)` per connection,
/// in order. Returns the base URL and a counter of requests served.
pub async fn http_stub(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();

    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            read_request(&mut socket).await;
            counter.fetch_add(1, Ordering::SeqCst);
            let reply = format!(
                "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(reply.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (url, served)
}

/// Local server that accepts connections and never answers.
pub async fn silent_stub() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    url
}

/// Read one request: headers, then `Content-Length` bytes of body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
        let length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + length {
            return;
        }
    }
}

/// HTTP client that ignores proxy settings from the environment.
pub fn direct_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub fn png_payload() -> ImagePayload {
    ImagePayload {
        bytes: b"not really a png".to_vec(),
        mime_type: "image/png",
    }
}
