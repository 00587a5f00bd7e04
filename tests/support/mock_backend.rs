//! Minimal HTTP backend the integration tests launch as an application process
//!
//! The test binary re-executes itself with the ignored `mock_backend_process`
//! test selected; the launcher passes the port through `PORT`.
//!
//! Routes: `/headers` echoes request headers as JSON, `/exit` terminates the
//! process, `/error` answers 500, anything else answers with the port.
//! A request with `Upgrade: echo` is switched to a raw byte echo.

use std::env;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Arguments that make the test binary run only the backend entry point
pub const ENTRY_ARGS: [&str; 4] = ["mock_backend_process", "--exact", "--ignored", "--nocapture"];

/// Launch spec running the backend from the current test binary
pub fn launch_spec() -> hostgate::registry::LaunchSpec {
    hostgate::registry::LaunchSpec::new(&executable())
        .with_args(ENTRY_ARGS.iter().map(|a| a.to_string()).collect())
}

pub fn executable() -> String {
    env::current_exe()
        .expect("test binary path")
        .to_string_lossy()
        .into_owned()
}

/// The port to serve on, present only when launched as a backend
pub fn port_from_env() -> Option<u16> {
    env::var("PORT").ok()?.parse().ok()
}

pub async fn serve(port: u16) -> std::io::Result<()> {
    let bind = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string());
    let listener = TcpListener::bind((bind.as_str(), port)).await?;
    println!("mock backend: listening on {}:{}", bind, port);

    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, port).await {
                eprintln!("mock backend: connection error: {}", e);
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, port: u16) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 8192 {
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("GET").to_string();
    let path = parts.next().unwrap_or("/").to_string();

    let headers: Vec<(String, String)> = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();
    let header = |name: &str| headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());

    println!("mock backend: {} {}", method, path);

    if header("upgrade").map(|v| v.eq_ignore_ascii_case("echo")).unwrap_or(false) {
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n")
            .await?;
        // bytes the client sent right behind the handshake
        if buf.len() > head_end {
            stream.write_all(&buf[head_end..]).await?;
        }
        let (mut reader, mut writer) = stream.into_split();
        tokio::io::copy(&mut reader, &mut writer).await?;
        return Ok(());
    }

    let content_length: usize = header("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let (status, content_type, response_body) = match path.as_str() {
        "/headers" => {
            let map: serde_json::Map<String, serde_json::Value> = headers
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            ("200 OK", "application/json", serde_json::Value::Object(map).to_string())
        }
        "/error" => ("500 Internal Server Error", "text/plain", "error".to_string()),
        "/exit" => {
            respond(&mut stream, "200 OK", "text/plain", "bye").await?;
            std::process::exit(0);
        }
        _ => (
            "200 OK",
            "text/plain",
            format!(
                "port={} method={} path={} body={}",
                port,
                method,
                path,
                String::from_utf8_lossy(&body)
            ),
        ),
    };

    respond(&mut stream, status, content_type, &response_body).await
}

async fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\nX-Mock-Backend: true\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
