// crates/retrovue-airsrv/src/metrics_http.rs
//
// Minimal HTTP/1.0 listener that serves MetricsStore::render_prometheus_text
// on every request to any path. A real HTTP server (routing, keep-alive,
// TLS) is the out-of-scope external collaborator (spec.md §1); this just
// proves out the one response body that matters.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;

use retrovue_core::metrics::MetricsStore;

pub fn serve(listener: TcpListener, metrics: Arc<MetricsStore>) {
    for incoming in listener.incoming() {
        match incoming {
            Ok(mut stream) => {
                // Drain and discard the request; we don't route by path.
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let body = metrics.render_prometheus_text();
                let response = format!(
                    "HTTP/1.0 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
            Err(err) => tracing::warn!(%err, "metrics accept failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead as _;
    use std::net::TcpStream;

    #[test]
    fn serves_prometheus_text_to_connecting_client() {
        let metrics = Arc::new(MetricsStore::new());
        metrics.update(1, |m| m.buffer_depth_frames = 9);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics_for_thread = metrics.clone();
        std::thread::spawn(move || serve(listener, metrics_for_thread));

        let stream = TcpStream::connect(addr).unwrap();
        let mut writer = stream.try_clone().unwrap();
        writer.write_all(b"GET /metrics HTTP/1.0\r\n\r\n").unwrap();
        let mut reader = std::io::BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).unwrap();
        assert!(status_line.contains("200"));

        let mut content_type_line = String::new();
        reader.read_line(&mut content_type_line).unwrap();
        assert_eq!(content_type_line.trim(), "Content-Type: text/plain; version=0.0.4; charset=utf-8");
    }
}
