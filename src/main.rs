use clap::Parser;
use colored::*;
use std::io::{self, BufRead, Write};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use draw_nexus::cli::{Args, ChatArgs, CollabArgs, Command, CredsAction, CredsArgs, ModelsArgs, ParseUrlArgs, ServeArgs};
use draw_nexus::client::{ChatClient, ChatSession};
use draw_nexus::config::ServerConfig;
use draw_nexus::coordinator::{run_session, DocumentState};
use draw_nexus::page;
use draw_nexus::providers::LlmConfig;
use draw_nexus::state::ClientState;
use draw_nexus::store::ProjectStore;
use draw_nexus::web;

fn init_tracing(verbose: bool, serving: bool) {
    let default = match (verbose, serving) {
        (true, _) => "draw_nexus=debug,info",
        (false, true) => "info",
        (false, false) => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn run_serve(args: ServeArgs) -> draw_nexus::Result<()> {
    let mut config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    web::serve(config).await
}

async fn run_chat(args: ChatArgs) -> draw_nexus::Result<()> {
    let cfg = args.client.to_config();
    let mut state = ClientState::load(&cfg.state_path, cfg.daily_limit)?;
    let client = ChatClient::new(cfg.server_url.clone());
    let mut session = ChatSession::new(&client);
    if let Some(system) = &args.system {
        session = session.with_system_prompt(system.clone());
    }

    let prompt = match &args.url {
        Some(url) => {
            let reference = client.parse_url(&state.gate, url).await?;
            eprintln!("{}", format!("  quoting {} ({})", reference.title, reference.site_name).dimmed());
            page::prompt_with_reference(&args.prompt, &reference)
        }
        None => args.prompt.clone(),
    };

    let result = if args.no_stream {
        session.complete(&mut state, &args.project, &prompt).await.map(|content| {
            println!("{}", content);
        })
    } else {
        let mut stdout = io::stdout();
        session
            .send(&mut state, &args.project, &prompt, |fragment, _| {
                let _ = write!(stdout, "{}", fragment);
                let _ = stdout.flush();
            })
            .await
            .map(|_| println!())
    };

    state.save(&cfg.state_path)?;
    result?;

    if !state.gate.credentials().has_any() {
        eprintln!(
            "{}",
            format!("  {} of {} free requests left today", state.gate.remaining(), state.gate.limit()).dimmed()
        );
    }
    Ok(())
}

async fn run_models(args: ModelsArgs) -> draw_nexus::Result<()> {
    let cfg = args.client.to_config();
    let state = ClientState::load(&cfg.state_path, cfg.daily_limit)?;
    let client = ChatClient::new(cfg.server_url.clone());
    let override_config = args.override_config();
    let models = client.list_models(&state.gate, override_config.as_ref()).await?;
    if models.is_empty() {
        eprintln!("{}", "  no models reported".yellow());
    }
    for id in models {
        println!("{}", id);
    }
    Ok(())
}

async fn run_parse_url(args: ParseUrlArgs) -> draw_nexus::Result<()> {
    let cfg = args.client.to_config();
    let state = ClientState::load(&cfg.state_path, cfg.daily_limit)?;
    let client = ChatClient::new(cfg.server_url.clone());
    let parsed = client.parse_url(&state.gate, &args.url).await?;
    eprintln!("{}", format!("  {} | {}", parsed.site_name, parsed.url).dimmed());
    println!("# {}\n\n{}", parsed.title, parsed.content);
    Ok(())
}

async fn run_collab(args: CollabArgs) -> draw_nexus::Result<()> {
    let cfg = args.client.to_config();
    let store = ProjectStore::open(&args.db)?;
    if store.get_project(&args.project)?.is_none() {
        let title = args.title.clone().unwrap_or_else(|| args.project.clone());
        store.create_project_with_id(&args.project, &title, args.engine)?;
    }
    let seeded = store.latest_version(&args.project)?.map(|v| v.content).unwrap_or_default();
    let doc = DocumentState::new(seeded.clone());

    let url = cfg.collab_url(&args.project);
    eprintln!("{}", format!("  joined {} (one line = whole document, Ctrl+C to leave)", url).bright_green());

    let (edit_tx, edit_rx) = mpsc::unbounded_channel();
    let (remote_tx, mut remote_rx) = mpsc::unbounded_channel::<String>();

    // Blocking stdin lives on its own thread so it never holds up shutdown.
    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines().map_while(|l| l.ok()) {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut lines = UnboundedReceiverStream::new(line_rx);
        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(line) => {
                        if edit_tx.send(line).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(content) = remote_rx.recv().await {
            println!("{} {}", "<<".bright_cyan(), content);
        }
    });

    let doc = run_session(&url, doc, edit_rx, remote_tx).await?;
    let _ = printer.await;

    if doc.content() != seeded && !doc.content().is_empty() {
        let version = store.create_version(&args.project, doc.content(), "collab session")?;
        eprintln!("{}", format!("  saved version {}", version.id).bright_blue());
    }
    Ok(())
}

fn run_creds(args: CredsArgs) -> draw_nexus::Result<()> {
    let cfg = args.client.to_config();
    let mut state = ClientState::load(&cfg.state_path, cfg.daily_limit)?;
    let creds = state.gate.credentials_mut();
    match args.action {
        CredsAction::SetPassword { password } => creds.set_access_password(password),
        CredsAction::ClearPassword => creds.clear_access_password(),
        CredsAction::SetLlm { provider, api_key, base_url, model } => creds.set_llm_config(LlmConfig {
            provider,
            base_url,
            api_key,
            model_id: model,
        }),
        CredsAction::ClearLlm => creds.clear_llm_config(),
        CredsAction::Show => {}
    }
    state.save(&cfg.state_path)?;

    let creds = state.gate.credentials();
    let yes_no = |b: bool| if b { "set".green() } else { "not set".dimmed() };
    println!("access password: {}", yes_no(creds.has_access_password()));
    match creds.llm_config() {
        Some(c) => println!("llm config:      {} {}", c.provider.to_string().green(), c.model_id),
        None => println!("llm config:      {}", yes_no(false)),
    }
    if creds.has_any() {
        println!("quota:           {}", "unlimited".green());
    } else {
        println!("quota:           {}/{} used today", state.gate.used(), state.gate.limit());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose, matches!(args.command, Command::Serve(_)));

    let result = match args.command {
        Command::Serve(a) => run_serve(a).await,
        Command::Chat(a) => run_chat(a).await,
        Command::ParseUrl(a) => run_parse_url(a).await,
        Command::Models(a) => run_models(a).await,
        Command::Collab(a) => run_collab(a).await,
        Command::Creds(a) => run_creds(a),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".bright_red(), e);
        std::process::exit(1);
    }
    Ok(())
}
