use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::net::read_head;

/// What a scripted upstream proxy does with each accepted connection.
#[derive(Debug, Clone)]
pub enum Script {
    /// Accept one CONNECT, confirm with 200, then echo tunnel bytes back.
    EchoAfterConnect,
    /// Accept one CONNECT, confirm, then answer the request inside the
    /// tunnel with a canned response and close.
    RespondAfterConnect { response: String },
    /// Reject the first CONNECT with the given status line.
    Reject { status: u16, message: String },
    /// Accept two CONNECTs on the same socket (corporate then rotating in
    /// one process), then echo tunnel bytes back.
    ChainedEcho,
    /// Accept the first CONNECT, reject the second.
    ChainedReject { status: u16, message: String },
    /// Read one plain request and answer it with a canned response.
    Respond { response: String },
}

/// A fake upstream proxy driven by a [`Script`], recording every CONNECT
/// target and request head it sees.
pub struct ScriptedProxy {
    pub addr: SocketAddr,
    connect_targets: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl ScriptedProxy {
    pub async fn spawn(script: Script) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let connect_targets = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let targets_task = connect_targets.clone();
        let requests_task = requests.clone();
        let connections_task = connections.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                connections_task.fetch_add(1, Ordering::SeqCst);
                let script = script.clone();
                let targets = targets_task.clone();
                let requests = requests_task.clone();
                tokio::spawn(async move {
                    let _ = run_script(stream, script, targets, requests).await;
                });
            }
        });

        Ok(Self {
            addr,
            connect_targets,
            requests,
            connections,
            handle,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn connect_targets(&self) -> Vec<String> {
        self.connect_targets.lock().await.clone()
    }

    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn run_script(
    mut stream: TcpStream,
    script: Script,
    targets: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<String>>>,
) -> Result<()> {
    match script {
        Script::EchoAfterConnect => {
            accept_connect(&mut stream, &targets).await?;
            echo(&mut stream).await
        }
        Script::RespondAfterConnect { response } => {
            accept_connect(&mut stream, &targets).await?;
            let head = read_head(&mut stream).await?;
            requests.lock().await.push(head);
            stream.write_all(response.as_bytes()).await?;
            stream.shutdown().await?;
            Ok(())
        }
        Script::Reject { status, message } => {
            let head = read_head(&mut stream).await?;
            targets.lock().await.push(connect_target(&head)?);
            let reply = format!("HTTP/1.1 {status} {message}\r\n\r\n");
            stream.write_all(reply.as_bytes()).await?;
            stream.shutdown().await?;
            Ok(())
        }
        Script::ChainedEcho => {
            accept_connect(&mut stream, &targets).await?;
            accept_connect(&mut stream, &targets).await?;
            echo(&mut stream).await
        }
        Script::ChainedReject { status, message } => {
            accept_connect(&mut stream, &targets).await?;
            let head = read_head(&mut stream).await?;
            targets.lock().await.push(connect_target(&head)?);
            let reply = format!("HTTP/1.1 {status} {message}\r\n\r\n");
            stream.write_all(reply.as_bytes()).await?;
            stream.shutdown().await?;
            Ok(())
        }
        Script::Respond { response } => {
            let head = read_head(&mut stream).await?;
            let body = read_body(&mut stream, &head).await?;
            requests.lock().await.push(format!("{head}{body}"));
            stream.write_all(response.as_bytes()).await?;
            stream.shutdown().await?;
            Ok(())
        }
    }
}

async fn accept_connect(stream: &mut TcpStream, targets: &Arc<Mutex<Vec<String>>>) -> Result<()> {
    let head = read_head(stream).await?;
    targets.lock().await.push(connect_target(&head)?);
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    Ok(())
}

fn connect_target(head: &str) -> Result<String> {
    let line = head.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("CONNECT"), Some(target)) => Ok(target.to_string()),
        _ => Err(anyhow!("expected CONNECT, got '{line}'")),
    }
}

async fn read_body(stream: &mut TcpStream, head: &str) -> Result<String> {
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok(String::from_utf8_lossy(&body).to_string())
}

async fn echo(stream: &mut TcpStream) -> Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
    }
    stream.shutdown().await?;
    Ok(())
}
