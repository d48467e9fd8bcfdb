//! Switchboard CLI Client
//!
//! Interactive controller for Switchboard servers.
//!
//! # Usage
//!
//! ```bash
//! # Connect to local server
//! swb
//!
//! # Connect to a service advertised on this machine
//! swb --service kitchen
//!
//! # Connect to a remote server
//! swb --host 10.0.0.5 --port 6390
//!
//! # Run actions and exit
//! swb -c "RfSwitch; ListSwitches"
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use swb_client::{ClientSession, ConnectionState};
use swb_core::{ArgSchema, Payload, BYE, ROUTER_KEY};
use swb_storage::{KeyValueStore, MemoryStore, SqliteStore, LAST_SERVICE_KEY};
use swb_transport::{FileDiscovery, LocalDiscovery, ServiceDiscovery, ServiceInfo, TransportError};

const DEFAULT_SERVICE: &str = "switchboard";
/// How long to wait for the first reply to a request
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
/// Quiet period that ends a burst of replies
const SETTLE: Duration = Duration::from_millis(300);

/// Switchboard Command Line Interface
#[derive(Parser, Debug)]
#[command(name = "swb")]
#[command(author, version, about = "Switchboard CLI - device control client")]
struct Args {
    /// Server hostname, used when the service is not advertised
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "SWB_HOST")]
    host: String,

    /// Server port, used when the service is not advertised
    #[arg(short, long, default_value = "6390", env = "SWB_PORT")]
    port: u16,

    /// Directory of service files written by swbd
    #[arg(long, env = "SWB_DISCOVERY_DIR")]
    discovery_dir: Option<PathBuf>,

    /// Service name (default: the last one used, else "switchboard")
    #[arg(short, long, env = "SWB_SERVICE")]
    service: Option<String>,

    /// SQLite file remembering the last service (default: nothing is kept)
    #[arg(long, env = "SWB_STATE")]
    state: Option<PathBuf>,

    /// Run actions separated by ';' and exit
    #[arg(short, long)]
    command: Option<String>,

    /// Quiet mode (no banner)
    #[arg(short, long)]
    quiet: bool,

    /// Log client internals to stderr
    #[arg(short, long)]
    verbose: bool,
}

/// One line of user input
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Help,
    History(Option<String>),
    Reconnect,
    Clear,
    Quit,
    Action(String),
}

/// Interpret `line` against the menu currently on screen
fn parse_input(line: &str, menu: &[String]) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }

    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default();
    match head.to_lowercase().as_str() {
        "help" => return Input::Help,
        "history" => return Input::History(words.next().map(str::to_string)),
        "reconnect" => return Input::Reconnect,
        "clear" => return Input::Clear,
        "quit" | "exit" => return Input::Quit,
        _ => {}
    }

    match line.parse::<usize>() {
        Ok(n) if (1..=menu.len()).contains(&n) => Input::Action(menu[n - 1].clone()),
        _ => Input::Action(line.to_string()),
    }
}

/// Actions given with `-c`
fn split_actions(command: &str) -> Vec<String> {
    command
        .split(';')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

struct Repl {
    session: ClientSession,
    updates: UnboundedReceiver<Payload>,
    /// Actions of the last rendered payload
    menu: Vec<String>,
    /// Key of the last rendered payload
    current: String,
}

impl Repl {
    fn new(session: ClientSession) -> Self {
        let updates = session.subscribe_all();
        Self {
            session,
            updates,
            menu: Vec::new(),
            current: ROUTER_KEY.to_string(),
        }
    }

    /// Print replies until the server goes quiet
    async fn show_replies(&mut self, wait: Duration) -> usize {
        let mut shown = 0;
        let mut window = wait;
        while let Ok(Some(payload)) = tokio::time::timeout(window, self.updates.recv()).await {
            self.render(&payload);
            shown += 1;
            window = SETTLE;
        }
        shown
    }

    /// Print anything that arrived while the prompt was open
    fn show_pending(&mut self) {
        while let Ok(payload) = self.updates.try_recv() {
            self.render(&payload);
        }
    }

    fn render(&mut self, payload: &Payload) {
        let key = format!("[{}]", payload.key()).dimmed();
        let response = payload.response().unwrap_or_default();
        if payload.is_command_info() {
            println!("{} {}", key, response.yellow());
            self.current = payload.key().to_string();
            return;
        }
        if payload.is_terminal() {
            println!("{} {}", key, response.magenta().bold());
        } else if payload.commands().is_empty() {
            // Device event or other out-of-band notice
            println!("{} {}", key, response.blue());
            if let Some(data) = payload.data() {
                println!("    {}", data.dimmed());
            }
            return;
        } else {
            println!("{} {}", key, response.green());
        }
        if let Some(data) = payload.data() {
            println!("    {}", data.dimmed());
        }

        self.current = payload.key().to_string();
        self.menu = payload.commands().to_vec();
        for (i, action) in self.menu.iter().enumerate() {
            println!("  {} {}", format!("{:>2})", i + 1).cyan(), action);
        }
    }

    /// Send `action` and print what comes back
    async fn run_action(&mut self, action: &str) {
        if self.session.state() != ConnectionState::Connected {
            println!("{}", "Not connected; queued until 'reconnect'.".yellow());
        }
        self.session.request(action);
        if self.show_replies(REPLY_TIMEOUT).await == 0 {
            println!("{}", "(no reply)".dimmed());
        }
    }

    /// Fill every pending argument form, re-asking while the server challenges
    async fn answer_forms(&mut self, rl: &mut DefaultEditor) -> Result<()> {
        while let Some(schema) = self.session.command_info(&self.current) {
            let values = match prompt_form(rl, &schema) {
                Ok(values) => values,
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                    self.session.take_command_info(&self.current);
                    println!("{}", "Cancelled.".yellow());
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let pairs: Vec<(&str, &str)> = values.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            self.session.answer_command_info(&self.current, &pairs);
            self.show_replies(REPLY_TIMEOUT).await;
        }
        Ok(())
    }

    fn print_history(&self, key: Option<&str>) {
        let key = key.unwrap_or(&self.current);
        let history = self.session.history(key);
        if history.is_empty() {
            println!("{}", format!("No history for {}", key).dimmed());
            return;
        }
        println!("{}", key.cyan().bold());
        for (i, payload) in history.iter().enumerate() {
            println!(
                "  {} {} {}",
                format!("{:>3}", i + 1).dimmed(),
                payload.effective_action().yellow(),
                payload.response().unwrap_or_default().replace('\n', " / ")
            );
        }
    }
}

/// Ask for each argument with its default pre-filled
fn prompt_form(rl: &mut DefaultEditor, schema: &ArgSchema) -> rustyline::Result<Vec<(String, String)>> {
    println!("{} {}", schema.command.cyan().bold(), schema.description);
    if !schema.syntax.is_empty() {
        println!("  {}", schema.syntax.dimmed());
    }
    let mut values = Vec::with_capacity(schema.entries.len());
    for entry in &schema.entries {
        let prompt = format!("  {}: ", entry.key.yellow());
        let value = tokio::task::block_in_place(|| rl.readline_with_initial(&prompt, (entry.value.as_str(), "")))?;
        values.push((entry.key.clone(), value.trim().to_string()));
    }
    Ok(values)
}

/// Where `name` can be found: its advertisement in the discovery directory,
/// else `host:port`
async fn locate(
    dir: PathBuf,
    name: &str,
    host: &str,
    port: u16,
) -> Result<(Arc<dyn ServiceDiscovery>, ServiceInfo)> {
    let files = FileDiscovery::new(&dir, host)
        .with_context(|| format!("Failed to open discovery directory {}", dir.display()))?;
    match files.resolve(name).await {
        Ok(service) => {
            debug!(service = %service, "Found advertised service");
            let discovery: Arc<dyn ServiceDiscovery> = Arc::new(files);
            Ok((discovery, service))
        }
        Err(TransportError::Discovery(e)) => {
            debug!(service = %name, reason = %e, "Service not advertised, using host and port");
            let service = ServiceInfo::new(name, host, port);
            let discovery: Arc<dyn ServiceDiscovery> =
                Arc::new(LocalDiscovery::new(host).with_service(service.clone()));
            Ok((discovery, service))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to look up {}", name)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let store: Arc<dyn KeyValueStore> = match &args.state {
        Some(path) => Arc::new(
            SqliteStore::new(path).with_context(|| format!("Failed to open state file {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let service = match args.service.clone() {
        Some(name) => name,
        None => store
            .get(LAST_SERVICE_KEY)
            .await?
            .unwrap_or_else(|| DEFAULT_SERVICE.to_string()),
    };
    let dir = args.discovery_dir.clone().unwrap_or_else(FileDiscovery::default_dir);
    let (discovery, found) = locate(dir, &service, &args.host, args.port).await?;

    let session = ClientSession::new()
        .with_store(store)
        .with_discovery(discovery);
    let mut repl = Repl::new(session.clone());

    // Ask for the chooser menu first; sent as soon as the connection opens
    session.send(Payload::ping());
    session
        .connect_service(&service)
        .await
        .with_context(|| format!("Failed to connect to {}", found))?;

    // Single command mode
    if let Some(command) = &args.command {
        repl.show_replies(REPLY_TIMEOUT).await;
        for action in split_actions(command) {
            println!("{} {}", ">".cyan(), action);
            repl.run_action(&action).await;
        }
        session.disconnect();
        return Ok(());
    }

    if !args.quiet {
        println!(
            "{}",
            format!(
                r#"
  ╔═╗╦ ╦╔╗    CLI
  ╚═╗║║║╠╩╗   Connected to {}
  ╚═╝╚╩╝╚═╝   Type a number or an action, 'help' for commands, 'quit' to exit
"#,
                found
            )
            .cyan()
        );
    }
    repl.show_replies(REPLY_TIMEOUT).await;

    // Interactive mode
    let mut rl = DefaultEditor::new()?;
    let history_path = dirs_next::home_dir()
        .map(|p| p.join(".swb_history"))
        .unwrap_or_default();

    let _ = rl.load_history(&history_path);

    loop {
        repl.show_pending();
        let prompt = match session.state() {
            ConnectionState::Connected => format!("{}> ", "swb".green()),
            _ => format!("{}> ", "swb".red()),
        };
        let line = match tokio::task::block_in_place(|| rl.readline(&prompt)) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        };

        let input = parse_input(&line, &repl.menu);
        if input != Input::Empty {
            let _ = rl.add_history_entry(line.trim());
        }

        match input {
            Input::Empty => continue,
            Input::Quit => break,
            Input::Help => print_help(),
            Input::Clear => print!("\x1B[2J\x1B[1;1H"),
            Input::History(key) => repl.print_history(key.as_deref()),
            Input::Reconnect => match session.reconnect().await {
                Ok(()) => {
                    println!("{}", "Reconnected.".yellow());
                    repl.show_replies(SETTLE).await;
                }
                Err(e) => eprintln!("{} {}", "Error:".red(), e),
            },
            Input::Action(action) => {
                repl.run_action(&action).await;
                repl.answer_forms(&mut rl).await?;
                if session.state() == ConnectionState::Disconnected {
                    let reason = session.last_error().unwrap_or_else(|| BYE.to_string());
                    println!("{} {}", "Connection closed:".red(), reason);
                    println!("{}", "Type 'reconnect' to start over.".dimmed());
                }
            }
        }
    }

    let _ = rl.save_history(&history_path);
    session.disconnect();
    Ok(())
}

fn print_help() {
    println!(
        r#"
{}

{}
  <n>                 Send the n-th action of the menu shown last
  <action>            Send an action by name (e.g. Ping, Reset, KnockKnock)

{}
  Ping                Repeat the current status
  ResetCurrent        Reset the active protocol
  Reset               Back to the protocol chooser

{}
  When an action needs arguments you are asked for each one, with the
  server's default already filled in. Ctrl-C cancels the form.

{}
  help                Show this help
  history [key]       Payloads received from a protocol
  reconnect           Connect again after the server closed the connection
  clear               Clear screen
  quit/exit           Exit CLI
"#,
        "Switchboard Commands".cyan().bold(),
        "Menu".yellow().bold(),
        "Always available".yellow().bold(),
        "Arguments".yellow().bold(),
        "Local".yellow().bold(),
    );
}

// Minimal dirs_next replacement for home directory
mod dirs_next {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
