//! Operator console: line-oriented commands on stdin for controlling the
//! server while it runs.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use parley_core::LogEntry;
use parley_server::{ServerConfig, ServerHandle};
use parley_settings::loader::parse_u64_range;
use parley_settings::{set_file_value, ParleySettings};
use parley_telemetry::{LogBuffer, ProcessSampler};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const DEFAULT_TAIL: usize = 20;

const HELP: &str = "\
Commands:
  /start                        start the server
  /stop                         stop the server
  /msg <client> <text>          private message to one client (ip:port or name)
  /connections                  list connected clients
  /stats                        traffic counters and process usage
  /log [n]                      last n log lines (default 20)
  /messages [n]                 last n chat messages (default 20)
  /set port|timeout|maxClients <value>
                                change a setting (applies on next /start)
  /help                         this text
  /quit                         stop the server and exit
Any other line is broadcast to every client: a JSON object is sent as-is,
plain text is sent from \"Server\".";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Setting {
    Port(u16),
    SessionTimeout(u64),
    MaxClients(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Private { client_id: String, text: String },
    Connections,
    Stats,
    Log(usize),
    Messages(usize),
    Set(Setting),
    Help,
    Quit,
    Broadcast(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Broadcast(line.to_string()));
        };

        let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let args = args.trim();
        match name {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "msg" => {
                let Some((client_id, text)) = args.split_once(char::is_whitespace) else {
                    bail!("usage: /msg <client> <text>");
                };
                Ok(Self::Private {
                    client_id: client_id.to_string(),
                    text: text.trim().to_string(),
                })
            }
            "connections" => Ok(Self::Connections),
            "stats" => Ok(Self::Stats),
            "log" => Ok(Self::Log(parse_count(args)?)),
            "messages" => Ok(Self::Messages(parse_count(args)?)),
            "set" => parse_setting(args).map(Self::Set),
            "help" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => bail!("unknown command /{other}, try /help"),
        }
    }
}

fn parse_count(args: &str) -> anyhow::Result<usize> {
    if args.is_empty() {
        return Ok(DEFAULT_TAIL);
    }
    args.parse()
        .with_context(|| format!("expected a line count, got {args:?}"))
}

fn parse_setting(args: &str) -> anyhow::Result<Setting> {
    let Some((key, value)) = args.split_once(char::is_whitespace) else {
        bail!("usage: /set port|timeout|maxClients <value>");
    };
    let value = value.trim();
    let invalid = || anyhow::anyhow!("invalid value {value:?} for {key}");
    match key {
        "port" => parse_u64_range(value, 1, u64::from(u16::MAX))
            .map(|n| Setting::Port(n as u16))
            .ok_or_else(invalid),
        "timeout" => parse_u64_range(value, 1, 86_400)
            .map(Setting::SessionTimeout)
            .ok_or_else(invalid),
        "maxClients" => parse_u64_range(value, 1, 1_000_000)
            .map(|n| Setting::MaxClients(n as usize))
            .ok_or_else(invalid),
        other => bail!("unknown setting {other}"),
    }
}

impl Setting {
    /// Location and value of this setting in the settings file.
    fn file_entry(&self) -> (&'static str, serde_json::Value) {
        match *self {
            Self::Port(port) => ("/server/port", port.into()),
            Self::SessionTimeout(secs) => ("/server/sessionTimeoutSecs", secs.into()),
            Self::MaxClients(n) => ("/server/maxClients", n.into()),
        }
    }

    fn apply(&self, settings: &mut ParleySettings) {
        match *self {
            Self::Port(port) => settings.server.port = port,
            Self::SessionTimeout(secs) => settings.server.session_timeout_secs = secs,
            Self::MaxClients(n) => settings.server.max_clients = n,
        }
    }
}

/// Whether the console loop should keep reading.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    settings: ParleySettings,
    settings_path: PathBuf,
    server: Option<ServerHandle>,
    log_buffer: Arc<LogBuffer>,
    sampler: ProcessSampler,
}

impl Console {
    pub fn new(settings: ParleySettings, settings_path: PathBuf, log_buffer: Arc<LogBuffer>) -> Self {
        Self {
            settings,
            settings_path,
            server: None,
            log_buffer,
            sampler: ProcessSampler::new(),
        }
    }

    pub fn server(&self) -> Option<&ServerHandle> {
        self.server.as_ref()
    }

    /// Read commands from stdin until `/quit`, end of input, or Ctrl-C.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "parley console, /help for commands")?;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else { break };

            let flow = match Command::parse(&line) {
                Ok(command) => self.execute(command, &mut stdout).await?,
                Err(e) => {
                    writeln!(stdout, "{e}")?;
                    Flow::Continue
                }
            };
            stdout.flush()?;
            if flow == Flow::Quit {
                return Ok(());
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn execute(&mut self, command: Command, out: &mut impl Write) -> anyhow::Result<Flow> {
        match command {
            Command::Empty => {}
            Command::Help => writeln!(out, "{HELP}")?,
            Command::Start => self.start(out).await?,
            Command::Stop => match self.server.take() {
                Some(handle) => {
                    handle.stop().await;
                    writeln!(out, "server stopped")?;
                }
                None => writeln!(out, "server is not running")?,
            },
            Command::Quit => {
                self.shutdown().await;
                writeln!(out, "bye")?;
                return Ok(Flow::Quit);
            }
            Command::Set(setting) => self.apply_setting(setting, out)?,
            Command::Log(n) => {
                for line in self.log_buffer.recent(n) {
                    writeln!(out, "{line}")?;
                }
            }
            Command::Private { client_id, text } => {
                let Some(server) = self.running(out)? else {
                    return Ok(Flow::Continue);
                };
                match server.dispatcher().send_private(&client_id, &text) {
                    Ok(()) => writeln!(out, "sent to {client_id}")?,
                    Err(e) => writeln!(out, "{e}")?,
                }
            }
            Command::Connections => {
                let Some(server) = self.running(out)? else {
                    return Ok(Flow::Continue);
                };
                let clients = server.active_connections();
                writeln!(out, "{} connected", clients.len())?;
                for client in clients {
                    writeln!(out, "  {client}")?;
                }
            }
            Command::Stats => {
                let Some(server) = self.running(out)? else {
                    return Ok(Flow::Continue);
                };
                let metrics = server.metrics();
                let usage = self.sampler.sample();
                writeln!(out, "uptime:               {}", metrics.formatted_uptime())?;
                writeln!(out, "active connections:   {}", server.registry().len())?;
                writeln!(out, "connections accepted: {}", metrics.connections_accepted())?;
                writeln!(out, "messages sent:        {}", metrics.messages_sent())?;
                writeln!(out, "messages received:    {}", metrics.messages_received())?;
                writeln!(out, "bytes sent:           {}", metrics.bytes_sent())?;
                writeln!(out, "bytes received:       {}", metrics.bytes_received())?;
                writeln!(out, "cpu:                  {:.1}%", usage.cpu_percent)?;
                writeln!(out, "memory:               {} KiB", usage.memory_kib)?;
            }
            Command::Messages(n) => {
                let Some(server) = self.running(out)? else {
                    return Ok(Flow::Continue);
                };
                for entry in server.dispatcher().recent_messages(n) {
                    writeln!(out, "{}", format_entry(&entry))?;
                }
            }
            Command::Broadcast(line) => {
                let Some(server) = self.running(out)? else {
                    return Ok(Flow::Continue);
                };
                let is_envelope = serde_json::from_str::<serde_json::Value>(&line)
                    .map(|v| v.is_object())
                    .unwrap_or(false);
                if is_envelope {
                    match server.dispatcher().broadcast(&line) {
                        Ok(n) => writeln!(out, "broadcast to {n} clients")?,
                        Err(e) => writeln!(out, "{e}")?,
                    }
                } else {
                    let n = server.dispatcher().announce(&line);
                    writeln!(out, "broadcast to {n} clients")?;
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn start(&mut self, out: &mut impl Write) -> anyhow::Result<()> {
        if let Some(server) = &self.server {
            writeln!(out, "server already running on {}", server.local_addr())?;
            return Ok(());
        }
        match parley_server::start(ServerConfig::from(&self.settings.server)).await {
            Ok(handle) => {
                writeln!(out, "server listening on {}", handle.local_addr())?;
                self.server = Some(handle);
            }
            Err(e) => {
                warn!(error = %e, "server failed to start");
                writeln!(out, "failed to start: {e}")?;
            }
        }
        Ok(())
    }

    fn apply_setting(&mut self, setting: Setting, out: &mut impl Write) -> anyhow::Result<()> {
        let (pointer, value) = setting.file_entry();
        if let Err(e) = set_file_value(&self.settings_path, pointer, value) {
            warn!(path = %self.settings_path.display(), error = %e, "setting not saved");
            writeln!(out, "setting not saved: {e}")?;
            return Ok(());
        }
        setting.apply(&mut self.settings);
        info!(path = %self.settings_path.display(), "settings saved");
        if self.server.is_some() {
            writeln!(out, "saved, restart the server to apply")?;
        } else {
            writeln!(out, "saved")?;
        }
        Ok(())
    }

    fn running(&self, out: &mut impl Write) -> anyhow::Result<Option<&ServerHandle>> {
        if self.server.is_none() {
            writeln!(out, "server is not running, use /start")?;
        }
        Ok(self.server.as_ref())
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.server.take() {
            handle.stop().await;
        }
    }
}

fn format_entry(entry: &LogEntry) -> String {
    format!(
        "[{}] {} ({}): {}",
        entry.timestamp, entry.sender, entry.ip, entry.content
    )
}
