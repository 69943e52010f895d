use anyhow::{Context, Result, bail};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};

use crate::control::{Command, Response};

/// A command handed to the main loop together with the way back to the
/// connection that sent it.
pub struct Request {
    pub command: Command,
    pub reply: oneshot::Sender<Response>,
}

pub type RequestSender = mpsc::UnboundedSender<Request>;

/// Reads newline-delimited JSON commands and writes one JSON response line
/// per command. Returns on EOF or once the main loop stops answering.
pub async fn serve_lines<R, W>(mut reader: R, mut writer: W, tx: RequestSender) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break; // EOF
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Command>(trimmed) {
            Ok(command) => {
                let (reply, answer) = oneshot::channel();
                if tx.send(Request { command, reply }).is_err() {
                    break;
                }
                match answer.await {
                    Ok(response) => response,
                    Err(_) => break,
                }
            }
            Err(e) => Response::Error {
                message: format!("Invalid command: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

pub async fn handle_stdin_commands(tx: RequestSender) -> Result<()> {
    let reader = BufReader::new(tokio::io::stdin());
    serve_lines(reader, tokio::io::stdout(), tx)
        .await
        .context("stdin command stream")
}

/// Accepts control connections until the listener fails. Each connection is
/// served on its own task; none of them touch the display directly.
pub async fn start_socket_server(tx: RequestSender, socket_path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(socket_path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(socket_path)
            .with_context(|| format!("remove stale socket {}", socket_path.display()))?,
        Ok(_) => bail!("{} exists and is not a socket", socket_path.display()),
        Err(_) => {}
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("bind control socket {}", socket_path.display()))?;
    tracing::info!(path = %socket_path.display(), "control socket listening");

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("accept control connection")?;
        let tx = tx.clone();
        tokio::spawn(async move {
            let (read, write) = stream.into_split();
            if let Err(e) = serve_lines(BufReader::new(read), write, tx).await {
                tracing::warn!("control connection error: {e:#}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::config::tests::scratch_dir;
    use crate::control::{Controller, Flow, NullStatus};
    use crate::driver::testing::{FakeDriver, original_ramp};
    use crate::ramp::{self, RampParams};
    use crate::session::GammaSession;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn drive(
        ctl: &mut Controller<FakeDriver>,
        mut rx: mpsc::UnboundedReceiver<Request>,
    ) -> Flow {
        while let Some(Request { command, reply }) = rx.recv().await {
            let (response, flow) = ctl.handle(command);
            let _ = reply.send(response);
            if flow == Flow::Quit {
                return flow;
            }
        }
        Flow::Continue
    }

    fn controller(dir: &Path) -> (Controller<FakeDriver>, FakeDriver) {
        let driver = FakeDriver::new(original_ramp());
        let mut session = GammaSession::new(driver.clone());
        session.start().unwrap();
        let ctl = Controller::new(
            session.into_shared(),
            ConfigStore::new(dir.join("config.json")),
            RampParams::default(),
            RampParams::default(),
            Box::new(NullStatus),
        );
        (ctl, driver)
    }

    fn responses(out: &[u8]) -> Vec<Response> {
        std::str::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn line_commands_reach_the_controller() {
        let dir = scratch_dir("ipc-lines");
        let (mut ctl, driver) = controller(&dir);
        let (tx, rx) = mpsc::unbounded_channel();

        let input = b"{\"type\":\"set\",\"gamma\":2.2}\n\nnot json\n{\"type\":\"status\"}\n";
        let mut out = Vec::new();
        let (served, flow) = tokio::join!(
            serve_lines(BufReader::new(&input[..]), &mut out, tx),
            drive(&mut ctl, rx)
        );
        served.unwrap();
        assert_eq!(flow, Flow::Continue);

        let replies = responses(&out);
        assert_eq!(replies.len(), 3);
        assert!(matches!(&replies[0], Response::Status { gamma, .. } if *gamma == 2.2));
        assert!(matches!(
            &replies[1],
            Response::Error { message } if message.starts_with("Invalid command")
        ));
        assert!(matches!(&replies[2], Response::Status { state, .. } if state == "active"));
        assert_eq!(driver.writes(), vec![ramp::compute(RampParams::new(2.2, 0.0, 1.0))]);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn quit_stops_the_stream() {
        let dir = scratch_dir("ipc-quit");
        let (mut ctl, driver) = controller(&dir);
        let (tx, rx) = mpsc::unbounded_channel();

        let input = b"{\"type\":\"quit\"}\n{\"type\":\"reset\"}\n";
        let mut out = Vec::new();
        let (served, flow) = tokio::join!(
            serve_lines(BufReader::new(&input[..]), &mut out, tx),
            drive(&mut ctl, rx)
        );
        served.unwrap();
        assert_eq!(flow, Flow::Quit);
        assert_eq!(responses(&out).len(), 1);
        assert_eq!(driver.writes(), vec![original_ramp()]);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn socket_server_answers_clients() {
        let dir = scratch_dir("ipc-socket");
        let socket = dir.join("control.sock");
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();

        let server_path = socket.clone();
        let server = tokio::spawn(async move { start_socket_server(tx, &server_path).await });
        let answer = tokio::spawn(async move {
            let Request { command, reply } = rx.recv().await.unwrap();
            assert_eq!(command, Command::Status);
            reply
                .send(Response::Error {
                    message: "pong".into(),
                })
                .unwrap();
        });

        let mut stream = loop {
            match tokio::net::UnixStream::connect(&socket).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        stream.write_all(b"{\"type\":\"status\"}\n").await.unwrap();
        let mut buf = vec![0u8; 256];
        let mut read = 0;
        while !buf[..read].contains(&b'\n') {
            read += stream.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(
            responses(&buf[..read]),
            vec![Response::Error {
                message: "pong".into()
            }]
        );

        answer.await.unwrap();
        server.abort();
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn socket_server_leaves_regular_files_alone() {
        let dir = scratch_dir("ipc-regular");
        let path = dir.join("config.json");
        std::fs::write(&path, "{}").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel::<Request>();

        let err = start_socket_server(tx, &path).await.unwrap_err();
        assert!(err.to_string().contains("not a socket"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = scratch_dir("ipc-stale");
        let socket = dir.join("control.sock");
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        let (tx, _rx) = mpsc::unbounded_channel::<Request>();
        let server_path = socket.clone();
        let server = tokio::spawn(async move { start_socket_server(tx, &server_path).await });
        let connected = loop {
            if server.is_finished() {
                break false;
            }
            if tokio::net::UnixStream::connect(&socket).await.is_ok() {
                break true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        assert!(connected);
        server.abort();
        std::fs::remove_dir_all(dir).unwrap();
    }
}
