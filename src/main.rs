use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{debug, info, warn};

use profile_sync::age::parse_birth_date;
use profile_sync::backend::firebase::{FirebaseAuth, FirebaseConfig, FirestoreProfiles, IdTokenSource};
use profile_sync::backend::memory::{InMemoryIdentitySource, InMemoryProfileStore};
use profile_sync::{
    Clock, IdentityError, IdentitySource, ProfilePatch, ProfileStore, ProviderKind, ReconcileError, Reconciler,
    ReconcilerConfig, SessionState, StoreError, SystemClock,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("firebase backend requested but FIREBASE_API_KEY / FIREBASE_PROJECT_ID are not set")]
    FirebaseNotConfigured,
    #[error("invalid --birth-date {raw}: {source}")]
    BirthDate { raw: String, source: time::error::Parse },
    #[error("unknown provider `{0}` (expected password, google.com or facebook.com)")]
    UnknownProvider(String),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("identity backend: {0}")]
    Identity(#[from] IdentityError),
    #[error("profile backend: {0}")]
    Store(#[from] StoreError),
    #[error("invalid JSON output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "profile-sync", about = "Sign in and reconcile the account's profile document")]
struct Cli {
    #[arg(long, env = "PROFILE_SYNC_BACKEND", value_enum, default_value_t = Backend::Auto)]
    backend: Backend,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Firebase when configured, otherwise in-memory.
    Auto,
    Memory,
    Firebase,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an email/password account, then apply any changes.
    SignUp(SessionArgs),
    /// Sign in with email/password, then apply any changes.
    SignIn(SessionArgs),
}

#[derive(Args, Debug)]
struct SessionArgs {
    #[arg(long, env = "PROFILE_SYNC_EMAIL")]
    email: String,

    #[arg(long, env = "PROFILE_SYNC_PASSWORD")]
    password: String,

    #[arg(long)]
    display_name: Option<String>,

    #[arg(long)]
    photo_url: Option<String>,

    #[arg(long)]
    address: Option<String>,

    #[arg(long, help = "Birth date as YYYY-MM-DD; age is derived from it")]
    birth_date: Option<String>,

    #[arg(long, help = "Provider id to unlink after signing in")]
    unlink: Option<String>,

    #[arg(long, default_value_t = false)]
    sign_out: bool,
}

impl SessionArgs {
    fn patch(&self) -> Result<ProfilePatch, CliError> {
        let mut patch = ProfilePatch::new();
        if let Some(name) = &self.display_name {
            patch = patch.display_name(name.as_str());
        }
        if let Some(photo) = &self.photo_url {
            patch = patch.photo_url(photo.as_str());
        }
        if let Some(address) = &self.address {
            patch = patch.address(address.as_str());
        }
        if let Some(raw) = &self.birth_date {
            let date = parse_birth_date(raw).map_err(|source| CliError::BirthDate { raw: raw.clone(), source })?;
            patch = patch.birth_date(date);
        }
        Ok(patch)
    }
}

type Collaborators = (Arc<dyn IdentitySource>, Arc<dyn ProfileStore>);

fn collaborators(backend: Backend, clock: &Arc<dyn Clock>) -> Result<Collaborators, CliError> {
    let firebase = match backend {
        Backend::Memory => None,
        Backend::Auto | Backend::Firebase => FirebaseConfig::from_env(),
    };

    match (backend, firebase) {
        (_, Some(config)) => {
            info!(project = %config.project_id, collection = %config.collection, "using firebase backend");
            let auth = Arc::new(FirebaseAuth::new(config.clone(), Arc::clone(clock))?);
            let profiles: Arc<dyn ProfileStore> =
                Arc::new(FirestoreProfiles::new(config)?.with_tokens(Arc::clone(&auth) as Arc<dyn IdTokenSource>));
            let identity: Arc<dyn IdentitySource> = auth;
            Ok((identity, profiles))
        }
        (Backend::Firebase, None) => Err(CliError::FirebaseNotConfigured),
        (_, None) => {
            info!("using in-memory backend; nothing persists past this run");
            let identity: Arc<dyn IdentitySource> = Arc::new(InMemoryIdentitySource::new());
            let profiles: Arc<dyn ProfileStore> = Arc::new(InMemoryProfileStore::new(Arc::clone(clock)));
            Ok((identity, profiles))
        }
    }
}

fn print_state(state: &SessionState) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}

async fn run(reconciler: &Reconciler, command: Command) -> Result<(), CliError> {
    let (args, new_account) = match command {
        Command::SignUp(args) => (args, true),
        Command::SignIn(args) => (args, false),
    };
    let patch = args.patch()?;

    if new_account {
        reconciler.sign_up(&args.email, &args.password).await?;
    } else {
        reconciler.sign_in(&args.email, &args.password).await?;
    }
    print_state(&reconciler.state())?;

    if !patch.is_empty() {
        reconciler.update_profile(patch).await?;
        print_state(&reconciler.state())?;
    }

    if let Some(provider_id) = &args.unlink {
        if ProviderKind::from_id(provider_id).is_none() {
            return Err(CliError::UnknownProvider(provider_id.clone()));
        }
        reconciler.unlink_provider(provider_id).await?;
        print_state(&reconciler.state())?;
    }

    if args.sign_out {
        reconciler.sign_out().await?;
        print_state(&reconciler.state())?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "failed to load .env"),
    }

    let cli = Cli::parse();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (identity, profiles) = collaborators(cli.backend, &clock)?;

    let reconciler = Reconciler::start(identity, profiles, clock, ReconcilerConfig::from_env()).await;
    let outcome = run(&reconciler, cli.command).await;
    if let Err(e) = &outcome {
        warn!(error = %e, "profile-sync failed");
    }
    reconciler.shutdown().await;
    outcome
}
