//! Scripted in-process FTP server for session tests
//!
//! Files and directories live in memory; every control connection shares
//! them. Control connections can be plain, upgraded with `AUTH TLS`, or TLS
//! from the first byte. Data connections are always plain.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::remote::path;

#[derive(Debug, Clone)]
pub struct FakeServerOptions {
    pub password: String,
    /// Advertise MLSD/MLST
    pub mlsd: bool,
    /// Accept EPSV; otherwise it is refused and not advertised
    pub epsv: bool,
    pub tls: FakeTls,
}

/// How the control connection is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeTls {
    /// `AUTH TLS` is refused with 502
    None,
    /// `AUTH TLS` upgrades the control connection
    Explicit,
    /// TLS handshake before the greeting
    Implicit,
}

impl Default for FakeServerOptions {
    fn default() -> Self {
        Self {
            password: "secret".to_string(),
            mlsd: true,
            epsv: true,
            tls: FakeTls::None,
        }
    }
}

const TEST_CERT: &[u8] = include_bytes!("testdata/cert.pem");
const TEST_KEY: &[u8] = include_bytes!("testdata/key.pem");

/// Acceptor for the self-signed `localhost`/`127.0.0.1` test certificate
fn test_acceptor() -> TlsAcceptor {
    let certs = rustls_pemfile::certs(&mut &TEST_CERT[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut &TEST_KEY[..])
        .unwrap()
        .unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

#[derive(Default)]
struct Fs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl Fs {
    fn exists(&self, p: &str) -> bool {
        self.files.contains_key(p) || self.dirs.contains(p)
    }

    fn children(&self, dir: &str) -> Vec<(String, Option<usize>)> {
        let dirs = self
            .dirs
            .iter()
            .filter(|d| d.as_str() != "/" && path::parent(d) == dir)
            .map(|d| (path::file_name(d).to_string(), None));
        let files = self
            .files
            .iter()
            .filter(|(f, _)| path::parent(f) == dir)
            .map(|(f, data)| (path::file_name(f).to_string(), Some(data.len())));
        dirs.chain(files).collect()
    }

    fn rename(&mut self, from: &str, to: &str) {
        if let Some(data) = self.files.remove(from) {
            self.files.insert(to.to_string(), data);
            return;
        }
        let moved: Vec<String> = self
            .dirs
            .iter()
            .filter(|d| path::is_within(from, d))
            .cloned()
            .collect();
        for d in moved {
            self.dirs.remove(&d);
            self.dirs.insert(format!("{}{}", to, &d[from.len()..]));
        }
        let moved: Vec<String> = self
            .files
            .keys()
            .filter(|f| path::is_within(from, f))
            .cloned()
            .collect();
        for f in moved {
            if let Some(data) = self.files.remove(&f) {
                self.files.insert(format!("{}{}", to, &f[from.len()..]), data);
            }
        }
    }
}

struct Shared {
    options: FakeServerOptions,
    fs: Mutex<Fs>,
    logins: AtomicUsize,
    /// Every command line received, with whether it arrived over TLS
    commands: Mutex<Vec<(String, bool)>>,
    acceptor: Option<TlsAcceptor>,
}

pub struct FakeFtpServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    kill: watch::Sender<u64>,
    task: JoinHandle<()>,
}

impl FakeFtpServer {
    pub async fn start(options: FakeServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut fs = Fs::default();
        fs.dirs.insert("/".to_string());
        let acceptor = (options.tls != FakeTls::None).then(test_acceptor);
        let shared = Arc::new(Shared {
            options,
            fs: Mutex::new(fs),
            logins: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            acceptor,
        });
        let (kill, _) = watch::channel(0u64);

        let accept_shared = Arc::clone(&shared);
        let accept_kill = kill.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let shared = Arc::clone(&accept_shared);
                let kill_rx = accept_kill.subscribe();
                tokio::spawn(handle_client(socket, shared, kill_rx));
            }
        });

        Self {
            addr,
            shared,
            kill,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Successful logins so far
    pub fn logins(&self) -> usize {
        self.shared.logins.load(Ordering::SeqCst)
    }

    /// Command lines received so far, in order, with their TLS flag
    pub fn commands(&self) -> Vec<(String, bool)> {
        self.shared.commands.lock().clone()
    }

    pub fn has_path(&self, p: &str) -> bool {
        self.shared.fs.lock().exists(p)
    }

    /// Close every open control connection from the server side
    pub fn drop_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }
}

impl Drop for FakeFtpServer {
    fn drop(&mut self) {
        self.task.abort();
        self.drop_connections();
    }
}

async fn reply<W: AsyncWrite + Unpin>(out: &mut W, text: &str) -> std::io::Result<()> {
    out.write_all(format!("{}\r\n", text).as_bytes()).await?;
    out.flush().await
}

async fn handle_client(socket: TcpStream, shared: Arc<Shared>, kill: watch::Receiver<u64>) {
    let acceptor = shared.acceptor.clone();
    match (shared.options.tls, acceptor) {
        (FakeTls::Implicit, Some(acceptor)) => {
            if let Ok(stream) = acceptor.accept(socket).await {
                serve(stream, &shared, kill, true, true).await;
            }
        }
        (_, acceptor) => {
            let upgraded = serve(socket, &shared, kill.clone(), true, false).await;
            if let (Some(socket), Some(acceptor)) = (upgraded, acceptor) {
                if let Ok(stream) = acceptor.accept(socket).await {
                    serve(stream, &shared, kill, false, true).await;
                }
            }
        }
    }
}

/// Command loop. Returns the raw stream when the client asked for
/// `AUTH TLS` and the server agreed.
async fn serve<S>(
    stream: S,
    shared: &Shared,
    mut kill: watch::Receiver<u64>,
    greet: bool,
    secure: bool,
) -> Option<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut out) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    let mut user = String::new();
    let mut pending: Option<TcpListener> = None;
    let mut rename_from: Option<String> = None;

    if greet && reply(&mut out, "220 fake ftp ready").await.is_err() {
        return None;
    }

    loop {
        let line = tokio::select! {
            _ = kill.changed() => return None,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => return None,
            },
        };
        shared.commands.lock().push((line.clone(), secure));
        let (cmd, arg) = match line.split_once(' ') {
            Some((c, a)) => (c.to_ascii_uppercase(), a.to_string()),
            None => (line.to_ascii_uppercase(), String::new()),
        };

        let result = match cmd.as_str() {
            "AUTH" if shared.options.tls == FakeTls::Explicit && !secure => {
                if reply(&mut out, "234 Proceed with negotiation.").await.is_err() {
                    return None;
                }
                let read_half = lines.into_inner().into_inner();
                return Some(read_half.unsplit(out));
            }
            "PBSZ" if secure => reply(&mut out, "200 PBSZ=0").await,
            "PROT" if secure => reply(&mut out, "200 Protection level set to P").await,
            "USER" => {
                user = arg;
                reply(&mut out, "331 Please specify the password.").await
            }
            "PASS" => {
                if user == "anonymous" || arg == shared.options.password {
                    shared.logins.fetch_add(1, Ordering::SeqCst);
                    reply(&mut out, "230 Login successful.").await
                } else {
                    reply(&mut out, "530 Login incorrect.").await
                }
            }
            "FEAT" => {
                let mut text = String::from("211-Features:\r\n");
                if shared.options.mlsd {
                    text.push_str(" MLST type*;size*;modify*;\r\n");
                }
                if shared.options.epsv {
                    text.push_str(" EPSV\r\n");
                }
                text.push_str(" UTF8\r\n211 End");
                reply(&mut out, &text).await
            }
            "TYPE" | "OPTS" | "NOOP" => reply(&mut out, "200 OK").await,
            "EPSV" if shared.options.epsv => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                pending = Some(listener);
                reply(
                    &mut out,
                    &format!("229 Entering Extended Passive Mode (|||{}|)", port),
                )
                .await
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                pending = Some(listener);
                reply(
                    &mut out,
                    &format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})",
                        port >> 8,
                        port & 0xff
                    ),
                )
                .await
            }
            "LIST" | "MLSD" => {
                let listing = {
                    let fs = shared.fs.lock();
                    fs.dirs
                        .contains(&arg)
                        .then(|| render_listing(&fs, &arg, cmd == "MLSD"))
                };
                match (listing, pending.take()) {
                    (Some(body), Some(listener)) => {
                        send_data(&mut out, listener, body.into_bytes()).await
                    }
                    (None, _) => reply(&mut out, "550 No such file or directory.").await,
                    (_, None) => reply(&mut out, "425 Use PASV or EPSV first.").await,
                }
            }
            "RETR" => {
                let data = shared.fs.lock().files.get(&arg).cloned();
                match (data, pending.take()) {
                    (Some(data), Some(listener)) => send_data(&mut out, listener, data).await,
                    (None, _) => reply(&mut out, "550 No such file or directory.").await,
                    (_, None) => reply(&mut out, "425 Use PASV or EPSV first.").await,
                }
            }
            "STOR" => match pending.take() {
                Some(listener) => {
                    let result = receive_data(&mut out, listener).await;
                    match result {
                        Ok(data) => {
                            shared.fs.lock().files.insert(arg, data);
                            reply(&mut out, "226 Transfer complete.").await
                        }
                        Err(e) => Err(e),
                    }
                }
                None => reply(&mut out, "425 Use PASV or EPSV first.").await,
            },
            "MLST" => {
                let facts = {
                    let fs = shared.fs.lock();
                    if fs.dirs.contains(&arg) {
                        Some(format!("type=dir;modify=20250101000000; {}", arg))
                    } else {
                        fs.files.get(&arg).map(|data| {
                            format!("type=file;size={};modify=20250101000000; {}", data.len(), arg)
                        })
                    }
                };
                match facts {
                    Some(facts) if shared.options.mlsd => {
                        reply(&mut out, &format!("250-Listing {}\r\n {}\r\n250 End", arg, facts))
                            .await
                    }
                    None if shared.options.mlsd => {
                        reply(&mut out, "550 No such file or directory.").await
                    }
                    _ => reply(&mut out, "500 Unknown command.").await,
                }
            }
            "DELE" => {
                let removed = shared.fs.lock().files.remove(&arg).is_some();
                if removed {
                    reply(&mut out, "250 Delete operation successful.").await
                } else {
                    reply(&mut out, "550 No such file or directory.").await
                }
            }
            "RMD" => {
                let outcome = {
                    let mut fs = shared.fs.lock();
                    if !fs.dirs.contains(&arg) {
                        "550 No such file or directory."
                    } else if !fs.children(&arg).is_empty() {
                        "550 Directory not empty."
                    } else {
                        fs.dirs.remove(&arg);
                        "250 Remove directory operation successful."
                    }
                };
                reply(&mut out, outcome).await
            }
            "MKD" => {
                let created = {
                    let mut fs = shared.fs.lock();
                    !fs.exists(&arg) && fs.dirs.insert(arg.clone())
                };
                if created {
                    reply(&mut out, &format!("257 \"{}\" created", arg)).await
                } else {
                    reply(&mut out, "550 Create directory operation failed.").await
                }
            }
            "RNFR" => {
                if shared.fs.lock().exists(&arg) {
                    rename_from = Some(arg);
                    reply(&mut out, "350 Ready for RNTO.").await
                } else {
                    reply(&mut out, "550 No such file or directory.").await
                }
            }
            "RNTO" => match rename_from.take() {
                Some(from) => {
                    shared.fs.lock().rename(&from, &arg);
                    reply(&mut out, "250 Rename successful.").await
                }
                None => reply(&mut out, "503 RNFR required first.").await,
            },
            "QUIT" => {
                let _ = reply(&mut out, "221 Goodbye.").await;
                return None;
            }
            _ => reply(&mut out, "502 Command not implemented.").await,
        };

        if result.is_err() {
            return None;
        }
    }
}

fn render_listing(fs: &Fs, dir: &str, mlsd: bool) -> String {
    let mut body = String::new();
    if mlsd {
        body.push_str("type=cdir;modify=20250101000000; .\r\n");
    } else {
        body.push_str("drwxr-xr-x    2 ftp      ftp          4096 Jan 01  2025 .\r\n");
        body.push_str("drwxr-xr-x    2 ftp      ftp          4096 Jan 01  2025 ..\r\n");
    }
    for (name, size) in fs.children(dir) {
        let line = match (mlsd, size) {
            (true, None) => format!("type=dir;modify=20250101000000; {}", name),
            (true, Some(size)) => {
                format!("type=file;size={};modify=20250101000000; {}", size, name)
            }
            (false, None) => format!(
                "drwxr-xr-x    2 ftp      ftp          4096 Jan 01  2025 {}",
                name
            ),
            (false, Some(size)) => format!(
                "-rw-r--r--    1 ftp      ftp      {:>8} Jan 01  2025 {}",
                size, name
            ),
        };
        body.push_str(&line);
        body.push_str("\r\n");
    }
    body
}

async fn send_data<W: AsyncWrite + Unpin>(
    out: &mut W,
    listener: TcpListener,
    data: Vec<u8>,
) -> std::io::Result<()> {
    reply(out, "150 Opening BINARY mode data connection.").await?;
    let (mut conn, _) = listener.accept().await?;
    conn.write_all(&data).await?;
    conn.shutdown().await?;
    drop(conn);
    reply(out, "226 Transfer complete.").await
}

async fn receive_data<W: AsyncWrite + Unpin>(
    out: &mut W,
    listener: TcpListener,
) -> std::io::Result<Vec<u8>> {
    reply(out, "150 Ok to send data.").await?;
    let (mut conn, _) = listener.accept().await?;
    let mut data = Vec::new();
    conn.read_to_end(&mut data).await?;
    Ok(data)
}
