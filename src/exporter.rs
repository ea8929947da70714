use std::{io, time::Duration};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    codec::{encode_batch, gzip, sign, SIGNATURE_HEADER},
    metric::Metric,
};

/// Wait before each delivery attempt; its length caps the attempts.
pub const RETRY_BACKOFF: [Duration; 4] = [
    Duration::from_secs(0),
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to compress batch: {0}")]
    Compress(#[from] io::Error),

    #[error("collector unreachable: {0}")]
    Transport(#[from] Box<ureq::Transport>),

    #[error("collector rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },
}
impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Posts metric batches to the collector's `/updates/` endpoint.
#[derive(Debug, Clone)]
pub struct HttpExporter {
    client: ureq::Agent,
    url: String,
    key: Option<String>,
    backoff: Vec<Duration>,
}
impl HttpExporter {
    pub fn new(addr: &str, key: Option<String>) -> Self {
        let client = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        Self {
            client,
            url: format!("http://{addr}/updates/"),
            key,
            backoff: RETRY_BACKOFF.to_vec(),
        }
    }

    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Blocking I/O
    pub fn export(&self, metrics: &[Metric]) -> Result<(), DeliveryError> {
        let body = encode_batch(metrics)?;
        let packed = gzip(&body)?;
        let mut req = self
            .client
            .post(&self.url)
            .set("Content-Type", "application/json")
            .set("Content-Encoding", "gzip")
            .set("Accept-Encoding", "gzip");
        if let Some(key) = &self.key {
            req = req.set(SIGNATURE_HEADER, &sign(&body, key));
        }
        match req.send_bytes(&packed) {
            Ok(resp) => {
                debug!(status = resp.status(), count = metrics.len(), "batch delivered");
                Ok(())
            }
            Err(ureq::Error::Status(status, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(DeliveryError::Rejected { status, body })
            }
            Err(ureq::Error::Transport(e)) => Err(Box::new(e).into()),
        }
    }

    /// Blocking I/O. Resends the same batch after transport failures, following the backoff
    /// schedule; any other failure returns at once.
    pub fn export_with_retry(&self, metrics: &[Metric]) -> Result<(), DeliveryError> {
        let mut last_err = None;
        for (attempt, wait) in self.backoff.iter().enumerate() {
            if !wait.is_zero() {
                std::thread::sleep(*wait);
            }
            match self.export(metrics) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "batch delivery failed");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::TcpListener,
        thread::JoinHandle,
    };

    use super::*;
    use crate::codec::{gunzip, verify};

    struct Received {
        body: Vec<u8>,
        signature: Option<String>,
    }

    /// Accepts one connection per entry: `None` hangs up, `Some(status)` answers with it.
    fn stub(script: Vec<Option<u16>>) -> (String, JoinHandle<Vec<Received>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let mut received = vec![];
            for step in script {
                let (stream, _) = listener.accept().unwrap();
                let Some(status) = step else {
                    drop(stream);
                    continue;
                };
                let mut rdr = BufReader::new(stream);
                let mut len = 0;
                let mut signature = None;
                loop {
                    let mut line = String::new();
                    rdr.read_line(&mut line).unwrap();
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        let value = value.trim();
                        if name.eq_ignore_ascii_case("content-length") {
                            len = value.parse().unwrap();
                        }
                        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
                            signature = Some(value.to_string());
                        }
                    }
                }
                let mut body = vec![0; len];
                rdr.read_exact(&mut body).unwrap();
                received.push(Received {
                    body: gunzip(&body).unwrap(),
                    signature,
                });
                let mut stream = rdr.into_inner();
                write!(
                    stream,
                    "HTTP/1.1 {status} X\r\nContent-Length: 2\r\nConnection: close\r\n\r\nno"
                )
                .unwrap();
            }
            received
        });
        (addr, handle)
    }

    fn batch() -> Vec<Metric> {
        vec![Metric::gauge("Alloc", 1.5), Metric::counter("PollCount", 2)]
    }

    #[test]
    fn delivers_signed_gzip_batch() {
        let (addr, server) = stub(vec![Some(200)]);
        let exporter = HttpExporter::new(&addr, Some("secret".into()));
        exporter.export(&batch()).unwrap();
        let received = server.join().unwrap();
        let sent: Vec<Metric> = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(sent, batch());
        let signature = received[0].signature.as_deref().unwrap();
        assert!(verify(&received[0].body, "secret", signature));
    }

    #[test]
    fn retries_transport_failures_with_same_batch() {
        let (addr, server) = stub(vec![None, None, Some(200)]);
        let exporter = HttpExporter::new(&addr, None).with_backoff(vec![Duration::ZERO; 4]);
        exporter.export_with_retry(&batch()).unwrap();
        let received = server.join().unwrap();
        assert_eq!(received.len(), 1);
        let sent: Vec<Metric> = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(sent, batch());
    }

    #[test]
    fn rejected_batch_is_not_retried() {
        let (addr, server) = stub(vec![Some(400)]);
        let exporter = HttpExporter::new(&addr, None).with_backoff(vec![Duration::ZERO; 4]);
        let err = exporter.export_with_retry(&batch()).unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 400, .. }));
        assert_eq!(server.join().unwrap().len(), 1);
    }

    #[test]
    fn gives_up_after_last_attempt() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let exporter = HttpExporter::new(&addr, None).with_backoff(vec![Duration::ZERO; 4]);
        let err = exporter.export_with_retry(&batch()).unwrap_err();
        assert!(err.is_retryable());
    }
}
