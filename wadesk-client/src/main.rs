use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt::MakeWriter};

use wadesk_client::{
    BackendClient, ClientError, ConfigError, ConsoleCommand, ConsoleConfig, ConsoleView,
    MessageBackend, MessageForm, SendRequest, Session, StatusBackend, Synchronizer,
    WsPushConnector, console, load_config, parse_command, render, submit_and_record,
};
use wadesk_core::{Attachment, Phase, SentMessage};

#[derive(Parser, Debug)]
#[command(name = "wadesk", version, about = "Operator console for a WhatsApp sending backend")]
struct Cli {
    /// Config file; defaults to config.json in the wadesk config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[arg(long, global = true)]
    push_url: Option<String>,
    #[arg(long, global = true)]
    token: Option<String>,
    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow connection status live until Ctrl-C. Reads operator commands from stdin.
    Watch {
        /// Write each new QR code image to this file.
        #[arg(long)]
        qr_out: Option<PathBuf>,
    },
    /// Print the current connection status.
    Status,
    /// Request a new QR code and wait until it is ready or polling gives up.
    RequestQr {
        /// Write the QR code image to this file.
        #[arg(long)]
        qr_out: Option<PathBuf>,
    },
    ExpireQr,
    AuthStatus,
    AuthReset,
    /// List message templates.
    Templates,
    /// Send a templated message.
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        name: String,
        /// Template id; defaults to the first template.
        #[arg(long)]
        template: Option<String>,
        /// YYYY-MM-DD
        #[arg(long)]
        date: Option<String>,
        /// HH:MM
        #[arg(long)]
        time: Option<String>,
        #[arg(long)]
        attachment: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{0}")]
    Refused(String),
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .init();
}

fn resolve_config(cli: &Cli) -> ConsoleConfig {
    let mut config = load_config(cli.config.as_deref());
    if let Some(url) = &cli.api_url {
        config.api_base_url = url.clone();
    }
    if let Some(url) = &cli.push_url {
        config.push_url = Some(url.clone());
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    config
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref());

    let config = resolve_config(&cli);
    let token = cli.token.clone().or_else(|| config.resolve_token());
    if token.is_none() {
        warn!("no bearer token configured; set WADESK_TOKEN or pass --token");
    }
    let session = Arc::new(Session::new(token));

    match run(cli.command, &config, session).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    command: Command,
    config: &ConsoleConfig,
    session: Arc<Session>,
) -> Result<(), CliError> {
    let backend = BackendClient::new(
        &config.api_base_url,
        Arc::clone(&session),
        config.request_timeout,
    )?;

    match command {
        Command::Watch { qr_out } => watch(config, backend, session, qr_out).await,
        Command::Status => {
            let status = backend.fetch_status().await?;
            print_json(&status);
            Ok(())
        }
        Command::RequestQr { qr_out } => {
            let sync = spawn_sync(config, backend, session)?;
            let view = sync.request_new_qr_and_wait().await;
            sync.teardown();

            println!("{}", render::render_view(&view));
            ensure_usable(&view)?;
            match (&view.status.qr, &qr_out) {
                (Some(qr), Some(path)) => write_qr(path, &qr.image).await,
                (Some(_), None) => {}
                (None, _) => println!("no QR code available yet"),
            }
            Ok(())
        }
        Command::ExpireQr => {
            let ack = backend.expire_qr().await?;
            print_ack(ack.success, ack.message.as_deref(), "QR expired")
        }
        Command::AuthStatus => {
            let response = backend.auth_status().await?;
            match response.auth_status {
                Some(auth) if auth.exists => {
                    let size = auth.details.and_then(|details| details.size);
                    match size {
                        Some(size) => println!("stored session: present ({size} bytes)"),
                        None => println!("stored session: present"),
                    }
                }
                Some(_) => println!("stored session: absent"),
                None => println!(
                    "{}",
                    response.message.as_deref().unwrap_or("auth status unavailable")
                ),
            }
            Ok(())
        }
        Command::AuthReset => {
            let ack = backend.reset_auth().await?;
            print_ack(ack.success, ack.message.as_deref(), "stored session cleared")
        }
        Command::Templates => {
            for template in backend.templates().await? {
                println!("{}\t{}", template.id, template.name);
            }
            Ok(())
        }
        Command::Send {
            to,
            name,
            template,
            date,
            time,
            attachment,
        } => {
            let request = SendRequest {
                to,
                template,
                name,
                date,
                time,
                attachment,
            };
            let attachment = match &request.attachment {
                Some(path) => Some(read_attachment(path).await?),
                None => None,
            };

            let messages = backend.clone();
            let sync = spawn_sync(config, backend, session)?;
            let view = sync.refresh_and_wait().await;
            ensure_usable(&view)?;

            let mut form = build_form(config, &messages).await?;
            request.fill(&mut form, attachment);
            let sent = submit_and_record(&mut form, &messages, &sync).await;
            sync.teardown();
            print_sent(&sent?);
            Ok(())
        }
    }
}

fn spawn_sync(
    config: &ConsoleConfig,
    backend: BackendClient,
    session: Arc<Session>,
) -> Result<Synchronizer, CliError> {
    let push_url = config.push_url()?;
    let connector = WsPushConnector::new(push_url, Arc::clone(&session), config.reconnect);
    Ok(Synchronizer::spawn(
        Arc::new(backend),
        Arc::new(connector),
        session,
        config.sync,
    ))
}

/// Turns an expired session or a failed pull into a command failure.
fn ensure_usable(view: &ConsoleView) -> Result<(), CliError> {
    if view.phase() == Phase::SessionExpired {
        return Err(ClientError::SessionExpired.into());
    }
    match &view.last_error {
        Some(message) => Err(CliError::Refused(message.clone())),
        None => Ok(()),
    }
}

async fn build_form(
    config: &ConsoleConfig,
    backend: &BackendClient,
) -> Result<MessageForm, CliError> {
    if !config.form.dynamic_templates {
        return Ok(MessageForm::with_builtin_catalog(config.form.requirements));
    }
    let mut form = MessageForm::with_dynamic_catalog(config.form.requirements);
    form.load_catalog(backend).await?;
    Ok(form)
}

fn print_sent(sent: &SentMessage) {
    println!(
        "sent to {} using \"{}\" (id {})",
        sent.recipient,
        sent.template,
        sent.message_id.as_deref().unwrap_or("-")
    );
    println!("{}", sent.preview);
}

async fn watch(
    config: &ConsoleConfig,
    backend: BackendClient,
    session: Arc<Session>,
    qr_out: Option<PathBuf>,
) -> Result<(), CliError> {
    info!(api = %config.api_base_url, "starting watch");
    let messages = backend.clone();
    let mut form = match build_form(config, &messages).await {
        Ok(form) => form,
        Err(err) => {
            warn!(error = %err, "templates unavailable; sending stays disabled until they load");
            MessageForm::with_dynamic_catalog(config.form.requirements)
        }
    };

    let sync = spawn_sync(config, backend, session)?;
    sync.initialize();
    print!("{}", console::help(form.requirements()));

    let mut rx = sync.subscribe();
    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;
    let mut last_qr: Option<String> = None;
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = rx.borrow_and_update().clone();
                println!("{}", render::render_view(&view));

                let image = view.status.qr.as_ref().map(|qr| qr.image.clone());
                if image != last_qr {
                    if let (Some(path), Some(uri)) = (&qr_out, &image) {
                        write_qr(path, uri).await;
                    }
                    last_qr = image;
                }
            }
            line = lines.recv(), if stdin_open => match line {
                Some(line) => handle_line(&line, &sync, &mut form, &messages).await,
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    sync.teardown();
    Ok(())
}

/// Blocking stdin reads live on their own thread so they never hold up shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("stdin closed: {err}");
                    break;
                }
            }
        }
    });
    rx
}

async fn handle_line(
    line: &str,
    sync: &Synchronizer,
    form: &mut MessageForm,
    messages: &BackendClient,
) {
    let command = match parse_command(line) {
        Ok(Some(command)) => command,
        Ok(None) => return,
        Err(err) => {
            eprintln!("{err}");
            return;
        }
    };

    match command {
        ConsoleCommand::Refresh => sync.request_status_refresh(),
        ConsoleCommand::RequestQr => sync.request_new_qr(),
        ConsoleCommand::ExpireQr => sync.expire_qr_manually(),
        ConsoleCommand::AuthStatus => sync.check_auth_status(),
        ConsoleCommand::AuthReset => sync.reset_auth(),
        ConsoleCommand::Dismiss(id) => sync.dismiss_notification(id),
        ConsoleCommand::Login(token) => sync.reauthenticate(token),
        ConsoleCommand::Help => print!("{}", console::help(form.requirements())),
        ConsoleCommand::Send(request) => {
            let attachment = match &request.attachment {
                Some(path) => match read_attachment(path).await {
                    Ok(attachment) => Some(attachment),
                    Err(err) => {
                        eprintln!("{err}");
                        return;
                    }
                },
                None => None,
            };
            if form.is_loading_catalog() && form.load_catalog(messages).await.is_err() {
                eprintln!("templates are still unavailable");
                return;
            }
            request.fill(form, attachment);
            match submit_and_record(form, messages, sync).await {
                Ok(sent) => print_sent(&sent),
                Err(err) => eprintln!("send failed: {err}"),
            }
        }
    }
}

async fn write_qr(path: &Path, uri: &str) {
    let Some((mime, bytes)) = render::decode_data_uri(uri) else {
        warn!(path = %path.display(), "QR image is not a base64 data URI");
        return;
    };
    match tokio::fs::write(path, &bytes).await {
        Ok(()) => info!(path = %path.display(), %mime, size = bytes.len(), "wrote QR image"),
        Err(err) => warn!(path = %path.display(), "failed to write QR image: {err}"),
    }
}

async fn read_attachment(path: &Path) -> Result<Attachment, CliError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| CliError::Io {
        path: path.to_owned(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_owned());
    Ok(Attachment {
        content_type: content_type_for(path).to_owned(),
        file_name,
        bytes,
    })
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => warn!("failed to format response: {err}"),
    }
}

fn print_ack(success: bool, message: Option<&str>, done: &str) -> Result<(), CliError> {
    if success {
        println!("{}", message.unwrap_or(done));
        Ok(())
    } else {
        Err(CliError::Refused(
            message.unwrap_or("backend refused the request").to_owned(),
        ))
    }
}
