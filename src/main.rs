use clap::{Parser, Subcommand};
use envforge::config::{ServiceConfig, META_NAMESPACE};
use envforge::connection::auth::AuthManager;
use envforge::connection::SessionRouter;
use envforge::differ::Differ;
use envforge::fake_services::ServiceRegistry;
use envforge::http::runs::{runs_table_schema, RunRegistry};
use envforge::http::test_suites::{test_suites_table_schema, tests_table_schema, TestSuiteRegistry};
use envforge::http::{build_router, AppState};
use envforge::isolation::{environments_table_schema, IsolationEngine};
use envforge::reflector::SchemaReflector;
use envforge::store::Store;
use envforge::template::{templates_table_schema, TemplateRegistry};
use envforge::token::TokenService;
use std::error::Error;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "envforge")]
#[command(about = "Ephemeral, isolated replicas of third-party SaaS services for deterministic agent testing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Serve {
        /// Overrides ENVFORGE_BIND_ADDR / the default bind address
        #[arg(long)]
        bind_addr: Option<String>,
        /// A pre-generated API key to bootstrap with, instead of
        /// generating and logging a random one
        #[arg(long)]
        bootstrap_api_key: Option<String>,
    },
    /// Validate a template definition file (JSON or YAML) without
    /// registering it against a running server
    MigrateTemplate {
        /// Path to a `{serviceName, templateName, structuralDefinition,
        /// seedBundle}` document
        path: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::MigrateTemplate { path }) => migrate_template(&path),
        Some(Commands::Serve { bind_addr, bootstrap_api_key }) => serve(bind_addr, bootstrap_api_key).await,
        None => serve(None, None).await,
    }
}

async fn serve(bind_addr_override: Option<String>, bootstrap_api_key: Option<String>) -> Result<(), Box<dyn Error>> {
    let mut config = ServiceConfig::from_env()?;
    if let Some(addr) = bind_addr_override {
        config = config.bind_addr(addr);
    }

    let store = Arc::new(Store::new());
    store.create_namespace(META_NAMESPACE).await?;

    let sessions = Arc::new(SessionRouter::new(Arc::clone(&store), config.max_connections, config.connect_timeout));
    {
        let meta = sessions.session_for(META_NAMESPACE).await?;
        meta.create_table(templates_table_schema()).await?;
        meta.create_table(environments_table_schema()).await?;
        meta.create_table(runs_table_schema()).await?;
        meta.create_table(test_suites_table_schema()).await?;
        meta.create_table(tests_table_schema()).await?;
    }

    let templates = Arc::new(TemplateRegistry::new(Arc::clone(&sessions)));
    let reflector = Arc::new(SchemaReflector::new(Arc::clone(&store), config.reflector_cache_size));
    let isolation = Arc::new(IsolationEngine::new(
        Arc::clone(&store),
        Arc::clone(&sessions),
        Arc::clone(&templates),
        Arc::clone(&reflector),
    ));
    let differ = Arc::new(Differ::new(Arc::clone(&store), Arc::clone(&reflector)));

    let tokens = Arc::new(match &config.jwt_secret {
        Some(secret) => TokenService::new(secret),
        None => TokenService::with_generated_secret(),
    });

    let raw_bootstrap_key = bootstrap_api_key.or_else(|| std::env::var("ENVFORGE_BOOTSTRAP_API_KEY").ok());
    let auth = Arc::new(match raw_bootstrap_key {
        Some(raw_key) => AuthManager::with_bootstrap_key("bootstrap", &raw_key).await?,
        None => {
            let manager = AuthManager::new();
            let (key, raw) = manager.issue_key("bootstrap").await?;
            warn!(key_id = %key.id(), raw_key = %raw, "no ENVFORGE_BOOTSTRAP_API_KEY set, issued an ephemeral bootstrap key");
            manager
        }
    });

    let test_suites = Arc::new(TestSuiteRegistry::new(Arc::clone(&sessions)));
    let runs = Arc::new(RunRegistry::new(Arc::clone(&sessions)));
    let services = Arc::new(ServiceRegistry::with_builtin());

    let state = Arc::new(AppState {
        store,
        sessions,
        templates,
        isolation: Arc::clone(&isolation),
        reflector,
        differ,
        tokens,
        auth,
        test_suites,
        runs,
        services,
        config: config.clone(),
    });

    let reaper_interval = config.expire_pass_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reaper_interval);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp();
            if let Err(err) = isolation.expire_pass(now).await {
                warn!(error = %err, "expire pass failed");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "envforge listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Validates the shape of a template definition file without a running
/// server or Store to register it against — the Store is in-memory only,
/// so there is nothing durable to "migrate" a template into ahead of
/// time. Lets a template author catch a malformed definition before
/// submitting it through `create_template_from_env`'s JSON shape.
fn migrate_template(path: &std::path::Path) -> Result<(), Box<dyn Error>> {
    let contents = std::fs::read_to_string(path)?;
    let definition: serde_json::Value = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&contents)?
    } else {
        serde_yaml::from_str(&contents)?
    };

    for field in ["serviceName", "templateName", "structuralDefinition"] {
        if definition.get(field).is_none() {
            return Err(format!("template definition missing required field '{field}'").into());
        }
    }

    println!("{}: valid template definition", path.display());
    Ok(())
}
