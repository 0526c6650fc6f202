use clap::{Parser, Subcommand};
use kijang::controller::Notification;
use kijang::fragment::FragmentParser;
use kijang::message::LogMutation;
use kijang::prompts::{self, StarterPrompt};
use kijang::transport::HttpTransport;
use kijang::{Sender, SessionController, Status};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "kijang")]
#[command(about = "Kijang CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: KIJANG_CONFIG_PATH or ~/.kijang/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Chat with the agent server (interactive). Replies stream in as they are produced.
    Chat {
        /// Config file path (default: KIJANG_CONFIG_PATH or ~/.kijang/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// User id (default: KIJANG_USER_ID or user.id from config)
        #[arg(long, short, value_name = "ID")]
        user: Option<String>,

        /// Server base URL (default: KIJANG_SERVER_URL or server.baseUrl from config)
        #[arg(long, short, value_name = "URL")]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("kijang {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            user,
            server,
        }) => {
            if let Err(e) = run_chat(config, user, server).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(kijang::config::default_config_path);
    let dir = kijang::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    user: Option<String>,
    server: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = kijang::config::load_config(config_path)?;
    let user = user
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .or_else(|| kijang::config::resolve_user_id(&config))
        .ok_or_else(|| {
            anyhow::anyhow!("no user id; pass --user, set KIJANG_USER_ID, or set user.id in config")
        })?;
    let transport = match server {
        Some(url) => HttpTransport::with_base_url(&config, url),
        None => HttpTransport::from_config(&config),
    };
    log::info!("chatting as {} via {}", user, transport.base_url());

    let prompts = prompts::resolve_prompts(&config.prompts);
    let mut controller =
        SessionController::new(transport, FragmentParser::from_config(&config.stream));
    let mut renderer = Renderer::default();
    controller.subscribe(move |n| renderer.render(n));
    controller.initialize(user);

    println!(
        "Type a message, /1../{} for a suggestion, /stop, /thinking, /reset, /prompts or /exit.",
        prompts.len()
    );
    if controller.show_starter_prompts() {
        print_prompts(&prompts);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stream_live = true;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                match input {
                    "" => {}
                    "/exit" | "/quit" => break,
                    "/stop" => controller.stop_streaming(),
                    "/reset" => {
                        controller.reset();
                        stream_live = true;
                    }
                    "/prompts" => print_prompts(&prompts),
                    "/thinking" => match controller.latest_thinking() {
                        Some(thinking) => println!("~ {}", thinking.replace('\n', "\n~ ")),
                        None => println!("~ (no thinking recorded for the last reply)"),
                    },
                    _ => {
                        let text = input
                            .strip_prefix('/')
                            .and_then(|n| prompts::select(&prompts, n))
                            .map(|p| p.text.clone())
                            .unwrap_or_else(|| input.to_string());
                        if let Err(e) = controller.send_message(&text).await {
                            log::debug!("send failed: {}", e);
                        }
                    }
                }
            }
            alive = controller.process_next_event(), if stream_live => {
                stream_live = alive;
            }
        }
    }

    controller.teardown();
    Ok(())
}

fn print_prompts(prompts: &[StarterPrompt]) {
    for (i, p) in prompts.iter().enumerate() {
        println!("  /{}  {}: {}", i + 1, p.title, p.text);
    }
}

/// Prints bot replies incrementally as log mutations arrive.
#[derive(Default)]
struct Renderer {
    /// Open entry being printed and how many bytes of it are on screen.
    printing: Option<(String, usize)>,
}

impl Renderer {
    fn render(&mut self, notification: &Notification) {
        let mut out = std::io::stdout();
        match notification {
            Notification::Log(LogMutation::Append(m)) if m.sender == Sender::Bot => {
                self.finish_line();
                let _ = write!(out, "< {}", m.content);
                if m.open {
                    self.printing = Some((m.id.clone(), m.content.len()));
                } else {
                    let _ = writeln!(out);
                }
            }
            Notification::Log(LogMutation::Patch { id, content }) => {
                if let Some((open_id, shown)) = self.printing.as_mut() {
                    if open_id == id {
                        let _ = write!(out, "{}", content.get(*shown..).unwrap_or(""));
                        *shown = content.len();
                    }
                }
            }
            Notification::Log(LogMutation::Close { id }) => {
                if self.printing.as_ref().map(|(open_id, _)| open_id) == Some(id) {
                    self.finish_line();
                }
            }
            Notification::Log(_) => {}
            Notification::Status(Status::Idle) => {
                if self.printing.is_some() {
                    let _ = write!(out, " [stopped]");
                    self.finish_line();
                }
            }
            Notification::Status(_) => {}
            Notification::StreamError(e) => {
                self.finish_line();
                eprintln!("! {} (reply may be incomplete, /reset to reconnect)", e);
            }
            Notification::FragmentDropped { cause } => {
                log::debug!("dropped fragment: {}", cause);
            }
        }
        let _ = out.flush();
    }

    fn finish_line(&mut self) {
        if self.printing.take().is_some() {
            println!();
        }
    }
}
