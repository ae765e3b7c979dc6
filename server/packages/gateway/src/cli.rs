use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use janus_agent_schema::TranscriptFormat;
use janus_completion::{ChatMessage, CompletionClient, CompletionError};
use janus_sandbox::{HttpSandboxPlatform, PlatformError};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::artifacts::{ArtifactStore, HttpArtifactStore, LOCAL_SWEEP_PERIOD};
use crate::capability::GenerationFlags;
use crate::classifier::{Classifier, LlmRouteVerifier, RouteVerifier};
use crate::config::{ClassifierConfig, ConfigError, GatewayConfig};
use crate::router::{build_router_with_state, shutdown, AppState, AuthConfig, GatewayServices};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8088;
const DEFAULT_COMPLETION_URL: &str = "https://api.openai.com/v1";

#[derive(Parser, Debug)]
#[command(name = "janus", bin_name = "janus")]
#[command(about = "Routes chat completions to a model or a sandboxed agent", version)]
#[command(arg_required_else_help = true)]
pub struct JanusCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway HTTP server.
    Serve(Box<ServeArgs>),
    /// Classify one message and print the verdict as JSON.
    Classify(ClassifyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CompletionArgs {
    /// OpenAI-compatible base URL (requests go to `{url}/chat/completions`).
    #[arg(long, env = "JANUS_COMPLETION_URL", default_value = DEFAULT_COMPLETION_URL)]
    completion_url: String,

    #[arg(long, env = "JANUS_COMPLETION_API_KEY", hide_env_values = true)]
    completion_api_key: Option<String>,

    #[arg(long, env = "JANUS_CLASSIFIER_MODEL")]
    classifier_model: Option<String>,

    #[arg(long, env = "JANUS_CLASSIFIER_TIMEOUT_MS")]
    classifier_timeout_ms: Option<u64>,

    /// Skip the LLM verification pass; unmatched requests are simple.
    #[arg(long, env = "JANUS_NO_LLM_CLASSIFIER")]
    no_llm_classifier: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct FlagArgs {
    #[arg(long)]
    generate_image: bool,
    #[arg(long)]
    generate_video: bool,
    #[arg(long)]
    generate_audio: bool,
    #[arg(long)]
    deep_research: bool,
    #[arg(long)]
    web_search: bool,
}

impl From<&FlagArgs> for GenerationFlags {
    fn from(args: &FlagArgs) -> Self {
        Self {
            generate_image: args.generate_image,
            generate_video: args.generate_video,
            generate_audio: args.generate_audio,
            deep_research: args.deep_research,
            web_search: args.web_search,
        }
    }
}

#[derive(Args, Debug)]
pub struct ClassifyArgs {
    text: String,

    #[command(flatten)]
    flags: FlagArgs,

    #[command(flatten)]
    completion: CompletionArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TranscriptFormatArg {
    Janus,
    Claude,
}

impl From<TranscriptFormatArg> for TranscriptFormat {
    fn from(arg: TranscriptFormatArg) -> Self {
        match arg {
            TranscriptFormatArg::Janus => TranscriptFormat::Janus,
            TranscriptFormatArg::Claude => TranscriptFormat::Claude,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, short = 'H', env = "JANUS_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "JANUS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bearer token required on `/v1/*`.
    #[arg(long, short = 't', env = "JANUS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Origin used in artifact download URLs.
    #[arg(long, env = "JANUS_PUBLIC_URL")]
    public_url: Option<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,

    #[arg(long, env = "JANUS_MODEL_ID")]
    model_id: Option<String>,

    #[arg(long, env = "JANUS_FAST_MODEL")]
    fast_model: Option<String>,

    #[command(flatten)]
    completion: CompletionArgs,

    #[arg(long, env = "JANUS_SANDBOX_URL")]
    sandbox_url: String,

    #[arg(long, env = "JANUS_SANDBOX_TOKEN", hide_env_values = true)]
    sandbox_token: Option<String>,

    #[arg(long, env = "JANUS_SANDBOX_TTL_SECS")]
    sandbox_ttl_secs: Option<u64>,

    #[arg(long, env = "JANUS_NESTED_QUOTA")]
    nested_quota: Option<usize>,

    #[arg(long, env = "JANUS_POOL_SIZE")]
    pool_size: Option<usize>,

    #[arg(long, env = "JANUS_POOL_MAX_IDLE_SECS")]
    pool_max_idle_secs: Option<u64>,

    /// Agent command line; `{prompt_file}` is replaced with the prompt path.
    #[arg(long, env = "JANUS_AGENT_COMMAND")]
    agent_command: Option<String>,

    #[arg(long, env = "JANUS_TRANSCRIPT_FORMAT", value_enum)]
    transcript_format: Option<TranscriptFormatArg>,

    #[arg(long, env = "JANUS_AGENT_BUDGET_SECS")]
    agent_budget_secs: Option<u64>,

    #[arg(long, env = "JANUS_TOOL_TIMEOUT_SECS")]
    tool_timeout_secs: Option<u64>,

    #[arg(long, env = "JANUS_WORKSPACE_DIR")]
    workspace_dir: Option<String>,

    #[arg(long, env = "JANUS_ARTIFACT_DIR")]
    artifact_dir: Option<String>,

    #[arg(long, env = "JANUS_DOCS_DIR")]
    docs_dir: Option<String>,

    /// `NAME=reference` pairs exported to the agent.
    #[arg(long = "credential-ref", env = "JANUS_CREDENTIAL_REFS", value_delimiter = ',')]
    credential_refs: Vec<String>,

    #[arg(long = "expose-port", env = "JANUS_EXPOSE_PORTS", value_delimiter = ',')]
    expose_ports: Vec<u16>,

    #[arg(long, env = "JANUS_KEEPALIVE_MS")]
    keepalive_ms: Option<u64>,

    #[arg(long, env = "JANUS_INLINE_THRESHOLD")]
    inline_threshold: Option<u64>,

    #[arg(long, env = "JANUS_ARTIFACT_URL_TTL_SECS")]
    artifact_url_ttl_secs: Option<u64>,

    /// External object store for large artifacts; kept in memory if unset.
    #[arg(long, env = "JANUS_ARTIFACT_STORE_URL")]
    artifact_store_url: Option<String>,

    #[arg(long, env = "JANUS_ARTIFACT_STORE_TOKEN", hide_env_values = true)]
    artifact_store_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("invalid {name} url {value:?}: {message}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        message: String,
    },
    #[error("invalid credential reference {0:?}; expected NAME=reference")]
    InvalidCredentialRef(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("completion client error: {0}")]
    Completion(#[from] CompletionError),
    #[error("sandbox platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_janus() -> Result<(), CliError> {
    let cli = JanusCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: Command) -> Result<(), CliError> {
    match command {
        Command::Serve(args) => run_server(&args),
        Command::Classify(args) => run_classify(&args),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_server(server: &ServeArgs) -> Result<(), CliError> {
    let config = gateway_config(server)?;
    config.validate()?;

    let auth = match server.token.clone() {
        Some(token) => AuthConfig::with_token(token),
        None => AuthConfig::disabled(),
    };

    check_url("completion", &server.completion.completion_url)?;
    check_url("sandbox", &server.sandbox_url)?;
    let completion = CompletionClient::new(
        &server.completion.completion_url,
        server.completion.completion_api_key.clone(),
    )?;
    let platform = HttpSandboxPlatform::new(&server.sandbox_url, server.sandbox_token.clone())?;
    let artifact_store = match &server.artifact_store_url {
        Some(url) => {
            check_url("artifact store", url)?;
            Some(Arc::new(HttpArtifactStore::new(url, server.artifact_store_token.clone()))
                as Arc<dyn ArtifactStore>)
        }
        None => None,
    };

    let display_host = match server.host.as_str() {
        "0.0.0.0" | "::" => "localhost",
        other => other,
    };
    let public_base_url = match &server.public_url {
        Some(url) => {
            check_url("public", url)?;
            url.clone()
        }
        None => format!("http://{}:{}", display_host, server.port),
    };

    let services = GatewayServices {
        completion,
        platform: Arc::new(platform),
        sandbox_credential: server.sandbox_token.clone().unwrap_or_default(),
        artifact_store,
        public_base_url,
    };
    let state = Arc::new(AppState::new(&config, auth, services));
    let (mut router, state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = runtime()?;

    runtime.block_on(async move {
        if let Some(pool) = state.pool() {
            let _replenisher = pool.start_replenisher();
            tracing::info!(size = config.pool.size, "warm pool enabled");
        }
        let _artifact_sweeper = state
            .local_artifacts()
            .map(|store| store.start_sweeper(LOCAL_SWEEP_PERIOD));
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            model = %config.model_id,
            agent_budget_secs = config.agent.budget.as_secs(),
            "gateway listening"
        );
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down; terminating sandboxes");
                shutdown(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_classify(args: &ClassifyArgs) -> Result<(), CliError> {
    let config = classifier_config(&args.completion);
    let verifier: Option<Arc<dyn RouteVerifier>> = if config.llm_enabled {
        check_url("completion", &args.completion.completion_url)?;
        let client = CompletionClient::new(
            &args.completion.completion_url,
            args.completion.completion_api_key.clone(),
        )?;
        Some(Arc::new(LlmRouteVerifier::new(client, config.model.clone())) as Arc<dyn RouteVerifier>)
    } else {
        None
    };
    let classifier = Classifier::new(config, verifier);
    let messages = vec![ChatMessage::user(args.text.clone())];
    let flags = GenerationFlags::from(&args.flags);

    let verdict = runtime()?.block_on(classifier.classify(&messages, &flags));
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

fn classifier_config(args: &CompletionArgs) -> ClassifierConfig {
    let mut config = ClassifierConfig::default();
    if let Some(model) = &args.classifier_model {
        config.model = model.clone();
    }
    if let Some(ms) = args.classifier_timeout_ms {
        config.timeout = Duration::from_millis(ms);
    }
    config.llm_enabled = !args.no_llm_classifier;
    config
}

fn gateway_config(server: &ServeArgs) -> Result<GatewayConfig, CliError> {
    let mut config = GatewayConfig {
        classifier: classifier_config(&server.completion),
        ..GatewayConfig::default()
    };
    if let Some(model_id) = &server.model_id {
        config.model_id = model_id.clone();
    }
    if let Some(model) = &server.fast_model {
        config.fast_path.model = model.clone();
    }

    if let Some(secs) = server.sandbox_ttl_secs {
        config.orchestrator.default_ttl = Duration::from_secs(secs);
    }
    if let Some(quota) = server.nested_quota {
        config.orchestrator.nested_quota = quota;
    }
    if let Some(size) = server.pool_size {
        config.pool.size = size;
    }
    if let Some(secs) = server.pool_max_idle_secs {
        config.pool.max_idle = Duration::from_secs(secs);
    }

    let agent = &mut config.agent;
    if let Some(command) = &server.agent_command {
        agent.command = command.split_whitespace().map(str::to_string).collect();
    }
    if let Some(format) = server.transcript_format {
        agent.transcript_format = format.into();
    }
    if let Some(secs) = server.agent_budget_secs {
        agent.budget = Duration::from_secs(secs);
    }
    if let Some(secs) = server.tool_timeout_secs {
        agent.tool_timeout = Duration::from_secs(secs);
    }
    if let Some(dir) = &server.workspace_dir {
        agent.workspace_dir = dir.clone();
    }
    if let Some(dir) = &server.artifact_dir {
        agent.artifact_dir = dir.clone();
    }
    if let Some(dir) = &server.docs_dir {
        agent.docs_dir = dir.clone();
    }
    agent.credential_refs = parse_credential_refs(&server.credential_refs)?;
    agent.expose_ports = server.expose_ports.clone();

    if let Some(ms) = server.keepalive_ms {
        config.multiplexer.keepalive = Duration::from_millis(ms);
    }
    if let Some(bytes) = server.inline_threshold {
        config.materializer.inline_threshold = bytes;
    }
    if let Some(secs) = server.artifact_url_ttl_secs {
        config.materializer.url_ttl = Duration::from_secs(secs);
    }
    Ok(config)
}

fn parse_credential_refs(pairs: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    let mut refs = BTreeMap::new();
    for pair in pairs.iter().filter(|pair| !pair.trim().is_empty()) {
        let (name, reference) = pair
            .split_once('=')
            .filter(|(name, _)| !name.trim().is_empty())
            .ok_or_else(|| CliError::InvalidCredentialRef(pair.clone()))?;
        refs.insert(name.trim().to_string(), reference.trim().to_string());
    }
    Ok(refs)
}

fn check_url(name: &'static str, value: &str) -> Result<(), CliError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|err| CliError::InvalidUrl {
            name,
            value: value.to_string(),
            message: err.to_string(),
        })
}

fn build_cors_layer(server: &ServeArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        // No configured origins means no cross-origin access.
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
