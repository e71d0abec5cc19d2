use clap::{Parser, ValueEnum};
use groqcfg_core::config::{
    ResolverOptions, SecretsMode, Settings, API_KEY_VAR, DEFAULT_VENV_DIR, MODEL_NAME_VAR,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
    Shell,
}

#[derive(Debug, Parser)]
#[command(name = "groqcfg", about = "Resolve GROQ_API_KEY and MODEL_NAME from layered sources")]
struct Args {
    /// Directory the `.env` search starts from. Defaults to the working directory.
    #[arg(long)]
    start_dir: Option<PathBuf>,

    /// Directory holding the virtual environment. Defaults to the directory of the
    /// nearest `.env`, else the nearest ancestor containing `<venv-dir>/.env`.
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Name of the virtual-environment directory under the project root.
    #[arg(long, default_value = DEFAULT_VENV_DIR)]
    venv_dir: String,

    /// Do not consult any secret store.
    #[arg(long)]
    no_secrets: bool,

    /// Read secrets from this TOML file instead of the Streamlit locations.
    #[arg(long, conflicts_with = "no_secrets")]
    secrets_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Print the api key in full (text and json formats).
    #[arg(long)]
    show_secret: bool,

    /// Exit with an error when no api key was resolved.
    #[arg(long)]
    require_key: bool,
}

impl Args {
    fn resolver_options(&self) -> ResolverOptions {
        let defaults = ResolverOptions::default();
        let secrets = match (&self.secrets_file, self.no_secrets) {
            (_, true) => SecretsMode::Disabled,
            (Some(path), false) => SecretsMode::File(path.clone()),
            (None, false) => SecretsMode::Streamlit,
        };

        ResolverOptions {
            start_dir: self.start_dir.clone().or(defaults.start_dir),
            project_root: self.project_root.clone(),
            venv_dir: self.venv_dir.clone(),
            secrets,
            ..defaults
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_tracing::layer())
        .init();

    let settings = groqcfg_core::config::init(args.resolver_options());
    let _sentry_guard = init_sentry(settings);

    if args.require_key {
        if let Err(err) = settings.require_api_key() {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %err, "no api key resolved");
            return Err(err);
        }
    }

    match args.format {
        Format::Text => print!("{}", render_text(settings, args.show_secret)),
        Format::Json => println!(
            "{}",
            serde_json::to_string_pretty(&settings.to_json(args.show_secret))?
        ),
        Format::Shell => print!("{}", render_shell(settings)),
    }

    Ok(())
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

fn render_text(settings: &Settings, show_secret: bool) -> String {
    let api_key = if show_secret {
        settings.api_key().map(str::to_string)
    } else {
        settings.redacted_api_key()
    };

    let mut out = String::new();
    match (api_key, settings.origin_of(API_KEY_VAR)) {
        (Some(key), Some(origin)) => {
            out.push_str(&format!("{API_KEY_VAR:<12} = {key} (from {origin})\n"));
        }
        _ => out.push_str(&format!("{API_KEY_VAR:<12} = <unset>\n")),
    }
    if let Some(origin) = settings.origin_of(MODEL_NAME_VAR) {
        out.push_str(&format!(
            "{MODEL_NAME_VAR:<12} = {} (from {origin})\n",
            settings.model_name()
        ));
    }
    out
}

/// `export` lines for `eval "$(groqcfg --format shell)"`.
fn render_shell(settings: &Settings) -> String {
    let mut out = String::new();
    if let Some(key) = settings.api_key() {
        out.push_str(&format!("export {API_KEY_VAR}={}\n", shell_quote(key)));
    }
    out.push_str(&format!(
        "export {MODEL_NAME_VAR}={}\n",
        shell_quote(settings.model_name())
    ));
    out
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
