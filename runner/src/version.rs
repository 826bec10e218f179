use crate::config::Config;
use crate::error::RunnerError;
use std::time::Duration;

/// Something that decides which image tag to run. Never fails.
pub trait VersionSource {
    fn resolve(&self) -> String;
}

pub struct VersionResolver {
    url: String,
    timeout: Duration,
    default_tag: String,
}

impl VersionResolver {
    pub fn new(url: &str, timeout: Duration, default_tag: &str) -> Self {
        Self {
            url: url.to_string(),
            timeout,
            default_tag: default_tag.to_string(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            &cfg.version_endpoint.url,
            Duration::from_secs(cfg.version_endpoint.timeout_sec),
            &cfg.image.default_tag,
        )
    }

    fn fetch(&self) -> Result<String, RunnerError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let response = client
            .get(&self.url)
            .header("User-Agent", "neuron-runner")
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(RunnerError::Process(format!(
                "version lookup failed: HTTP {status}"
            )));
        }
        Ok(response.text()?)
    }
}

impl VersionSource for VersionResolver {
    fn resolve(&self) -> String {
        let fetched = match self.fetch() {
            Ok(body) => Some(body),
            Err(err) => {
                tracing::warn!(url = %self.url, error = %err, "version lookup failed, using default tag");
                None
            }
        };
        let version = choose_version(fetched.as_deref(), &self.default_tag);
        tracing::info!(%version, "resolved image version");
        version
    }
}

/// A non-blank response is the version; anything else is the default tag.
pub fn choose_version(response: Option<&str>, default_tag: &str) -> String {
    match response.map(str::trim) {
        Some(version) if !version.is_empty() => version.to_string(),
        _ => default_tag.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serves exactly one HTTP response and returns the URL to hit.
    fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/version/docker")
    }

    fn unused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/version/docker")
    }

    fn resolver(url: &str) -> VersionResolver {
        VersionResolver::new(url, Duration::from_secs(5), "latest")
    }

    #[test]
    fn returns_endpoint_version() {
        let url = serve_once("200 OK", "v42");
        assert_eq!(resolver(&url).resolve(), "v42");
    }

    #[test]
    fn trims_whitespace_around_version() {
        let url = serve_once("200 OK", "v7\n");
        assert_eq!(resolver(&url).resolve(), "v7");
    }

    #[test]
    fn empty_body_falls_back_to_default() {
        let url = serve_once("200 OK", "");
        assert_eq!(resolver(&url).resolve(), "latest");
    }

    #[test]
    fn http_error_falls_back_to_default() {
        let url = serve_once("503 Service Unavailable", "v99");
        assert_eq!(resolver(&url).resolve(), "latest");
    }

    #[test]
    fn unreachable_endpoint_falls_back_to_default() {
        assert_eq!(resolver(&unused_url()).resolve(), "latest");
    }

    #[test]
    fn slow_endpoint_is_bounded_by_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = thread::spawn(move || {
            let accepted = listener.accept();
            thread::sleep(Duration::from_secs(3));
            drop(accepted);
        });
        let slow = VersionResolver::new(
            &format!("http://{addr}/"),
            Duration::from_millis(200),
            "latest",
        );
        let started = std::time::Instant::now();
        assert_eq!(slow.resolve(), "latest");
        assert!(started.elapsed() < Duration::from_secs(3));
        let _ = hold.join();
    }

    #[test]
    fn choose_version_never_returns_empty() {
        assert_eq!(choose_version(Some("v1"), "latest"), "v1");
        assert_eq!(choose_version(Some("   "), "latest"), "latest");
        assert_eq!(choose_version(None, "latest"), "latest");
    }
}
