use crate::client::DEFAULT_SERVER_URL;
use crate::config::{ClientConfig, ServerConfig, DEFAULT_STATE_PATH};
use crate::providers::{LlmConfig, Provider};
use crate::quota::DEFAULT_DAILY_LIMIT;
use crate::store::EngineType;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "draw-nexus")]
#[command(version)]
#[command(about = "LLM chat proxy and collaboration relay for AI-assisted diagram editing")]
pub struct Args {
    /// Debug-level logging for this crate (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP + WebSocket server
    Serve(ServeArgs),
    /// Send a prompt and stream the reply
    Chat(ChatArgs),
    /// List models offered through the server
    Models(ModelsArgs),
    /// Fetch a web page through the server and print it as markdown
    ParseUrl(ParseUrlArgs),
    /// Join a project's collaboration channel; stdin lines become the document
    Collab(CollabArgs),
    /// Manage the locally stored access password and LLM config
    Creds(CredsArgs),
}

/// Where a client command talks to and keeps its state.
#[derive(ClapArgs, Debug, Clone)]
pub struct ClientArgs {
    /// Base URL of the server's API
    #[arg(long, env = "DRAW_NEXUS_SERVER", default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    /// Client state file (chat history, quota, credentials)
    #[arg(long, env = "DRAW_NEXUS_STATE", default_value = DEFAULT_STATE_PATH)]
    pub state: PathBuf,

    /// Free requests per day without credentials
    #[arg(long, default_value_t = DEFAULT_DAILY_LIMIT)]
    pub daily_limit: u32,
}

impl ClientArgs {
    pub fn to_config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.server.clone(),
            state_path: self.state.clone(),
            daily_limit: self.daily_limit,
        }
    }
}

#[derive(ClapArgs, Debug)]
pub struct ServeArgs {
    /// Optional TOML file; environment variables override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind (overrides BIND)
    #[arg(long)]
    pub bind: Option<String>,

    /// Default upstream provider (overrides AI_PROVIDER)
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,
}

impl ServeArgs {
    /// Flags win over file and environment.
    pub fn apply(&self, cfg: &mut ServerConfig) {
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(bind) = &self.bind {
            cfg.bind = bind.clone();
        }
        if let Some(provider) = self.provider {
            if provider != cfg.provider {
                cfg.provider = provider;
                cfg.base_url = provider.default_base_url().to_string();
                cfg.model_id = provider.default_model().to_string();
            }
        }
    }
}

#[derive(ClapArgs, Debug)]
pub struct ChatArgs {
    /// Prompt to send
    pub prompt: String,

    /// Project whose chat history the turn belongs to
    #[arg(long, default_value = "default")]
    pub project: String,

    /// System prompt prepended to the conversation
    #[arg(long)]
    pub system: Option<String>,

    /// Wait for the whole reply instead of streaming it
    #[arg(long)]
    pub no_stream: bool,

    /// Web page quoted after the prompt as reference material
    #[arg(long)]
    pub url: Option<String>,

    #[command(flatten)]
    pub client: ClientArgs,
}

#[derive(ClapArgs, Debug)]
pub struct ParseUrlArgs {
    /// Page to fetch (http or https)
    pub url: String,

    #[command(flatten)]
    pub client: ClientArgs,
}

#[derive(ClapArgs, Debug)]
pub struct ModelsArgs {
    /// Ask for this provider's models instead of the stored/server config
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,

    #[arg(long, requires = "provider")]
    pub base_url: Option<String>,

    #[arg(long, requires = "provider")]
    pub api_key: Option<String>,

    #[command(flatten)]
    pub client: ClientArgs,
}

impl ModelsArgs {
    /// The one-off LLM config given on the command line, if any.
    pub fn override_config(&self) -> Option<LlmConfig> {
        self.provider.map(|provider| LlmConfig {
            provider,
            base_url: self.base_url.clone().unwrap_or_default(),
            api_key: self.api_key.clone().unwrap_or_default(),
            model_id: String::new(),
        })
    }
}

#[derive(ClapArgs, Debug)]
pub struct CollabArgs {
    /// Project id; also the collaboration channel
    pub project: String,

    /// SQLite file holding projects and versions
    #[arg(long, default_value = "./draw-nexus.db")]
    pub db: PathBuf,

    /// Title for the project if it does not exist yet
    #[arg(long)]
    pub title: Option<String>,

    /// Diagram engine for a new project
    #[arg(long, value_enum, default_value = "mermaid")]
    pub engine: EngineType,

    #[command(flatten)]
    pub client: ClientArgs,
}

#[derive(ClapArgs, Debug)]
pub struct CredsArgs {
    #[command(subcommand)]
    pub action: CredsAction,

    #[command(flatten)]
    pub client: ClientArgs,
}

#[derive(Subcommand, Debug)]
pub enum CredsAction {
    /// Store the shared access password
    SetPassword { password: String },
    /// Forget the access password
    ClearPassword,
    /// Store your own provider settings
    SetLlm {
        #[arg(long, value_enum)]
        provider: Provider,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = "")]
        base_url: String,
        #[arg(long, default_value = "")]
        model: String,
    },
    /// Forget your own provider settings
    ClearLlm,
    /// Print credential and quota status
    Show,
}
