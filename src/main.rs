use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderArg {
    Gmail,
    Outlook,
}

#[derive(Debug, Parser)]
#[command(
    name = "invoice-sync",
    version,
    about = "Incremental invoice attachment ingestion from linked mailboxes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the OAuth authorization URL for linking a mailbox
    Link(LinkArgs),
    /// Complete linking with the code and state from the provider redirect
    Callback(CallbackArgs),
    /// Ingest new invoice attachments for one provider or one user
    Sync(SyncArgs),
    /// Browse ingested attachments
    Attachments {
        #[command(subcommand)]
        command: AttachmentCommands,
    },
    /// Inspect and adjust linked integrations
    Integrations {
        #[command(subcommand)]
        command: IntegrationCommands,
    },
}

#[derive(Debug, Args)]
struct LinkArgs {
    #[arg(long, value_enum)]
    provider: ProviderArg,
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
struct CallbackArgs {
    #[arg(long, value_enum)]
    provider: ProviderArg,
    #[arg(long)]
    code: Option<String>,
    #[arg(long)]
    state: Option<String>,
    /// `error` query parameter sent by the provider, if any
    #[arg(long)]
    error: Option<String>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, value_enum)]
    provider: ProviderArg,
    /// Only sync this user's integration
    #[arg(long)]
    user: Option<String>,
    #[arg(long, default_value_t = false)]
    watch: bool,
    /// Seconds between passes in watch mode
    #[arg(long, default_value_t = 300, env = "INVOICE_SYNC_WATCH_INTERVAL")]
    interval: u64,
}

#[derive(Debug, Subcommand)]
enum AttachmentCommands {
    /// List a user's attachments, newest first
    List {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = invoice_sync::attachments::DEFAULT_PAGE_LIMIT)]
        limit: usize,
    },
    /// Show one attachment with its content
    Show {
        id: String,
        #[arg(long)]
        user: String,
    },
}

#[derive(Debug, Subcommand)]
enum IntegrationCommands {
    /// List integrations with status and watermark
    List {
        #[arg(long, value_enum)]
        provider: Option<ProviderArg>,
    },
    /// Set the date reading starts from when there is no cursor yet
    SetStart {
        #[arg(long, value_enum)]
        provider: ProviderArg,
        #[arg(long)]
        user: String,
        /// RFC 3339 timestamp or YYYY-MM-DD
        date: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::ops::ControlFlow;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use serde_json::json;
    use tracing::error;

    use invoice_sync::attachments;
    use invoice_sync::blob::FsBlobStore;
    use invoice_sync::config::Settings;
    use invoice_sync::connectors::AdapterRegistry;
    use invoice_sync::db::models::Provider;
    use invoice_sync::db::Database;
    use invoice_sync::handoff::{self, HandoffHandler, LogHandler, RetryPolicy, WebhookHandler};
    use invoice_sync::oauth::{self, CallbackHandler, CallbackParams};
    use invoice_sync::output::{self, OutputFormat};
    use invoice_sync::sync::{SyncEngine, SyncOptions, SyncScope};
    use invoice_sync::watermark;

    use super::{
        AttachmentCommands, CallbackArgs, Cli, Commands, IntegrationCommands, LinkArgs,
        ProviderArg, SyncArgs,
    };

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let settings = Settings::from_env().context("load INVOICE_SYNC_* configuration")?;
        let format = OutputFormat::from_json_flag(cli.json);

        match cli.command {
            Commands::Link(args) => handle_link(&settings, args, format),
            Commands::Callback(args) => handle_callback(&settings, args, format).await,
            Commands::Sync(args) => handle_sync(&settings, args, format).await,
            Commands::Attachments { command } => handle_attachments(&settings, command, format),
            Commands::Integrations { command } => {
                handle_integrations(&settings, command, format)
            }
        }
    }

    fn handle_link(settings: &Settings, args: LinkArgs, format: OutputFormat) -> Result<()> {
        let adapters = AdapterRegistry::from_settings(settings);
        let adapter = adapters.by_provider(map_provider(args.provider))?;
        let url = oauth::authorization_url(adapter, &args.user)?;
        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&json!({ "url": url }))?)
            }
            OutputFormat::Table => println!("{url}"),
        }
        Ok(())
    }

    async fn handle_callback(
        settings: &Settings,
        args: CallbackArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let db = settings.open_database()?;
        let adapters = AdapterRegistry::from_settings(settings);
        let adapter = adapters.by_provider(map_provider(args.provider))?;

        let handler = CallbackHandler::new(
            &db,
            adapter,
            &settings.frontend_url,
            settings.default_backfill_days,
        );
        let redirect = handler
            .handle(&CallbackParams {
                code: args.code,
                state: args.state,
                error: args.error,
            })
            .await?;
        println!("{}", output::format_redirect(format, &redirect)?);
        Ok(())
    }

    async fn handle_sync(settings: &Settings, args: SyncArgs, format: OutputFormat) -> Result<()> {
        let db = settings.open_database()?;
        let blobs = FsBlobStore::new(&settings.blob_dir)?;
        let adapters = AdapterRegistry::from_settings(settings);

        let provider = map_provider(args.provider);
        let scope = match args.user {
            Some(user_id) => SyncScope::Integration { user_id, provider },
            None => SyncScope::Provider(provider),
        };

        let run = SyncRun {
            db: &db,
            blobs: &blobs,
            adapters: &adapters,
            options: SyncOptions::from_settings(settings),
            policy: RetryPolicy::new(settings.handoff_max_attempts),
            scope,
            watch: args.watch.then(|| Duration::from_secs(args.interval.max(1))),
            format,
        };
        match settings.handoff_webhook_url.as_deref() {
            Some(url) => run.execute(WebhookHandler::new(url)).await,
            None => run.execute(LogHandler).await,
        }
    }

    struct SyncRun<'a> {
        db: &'a Database,
        blobs: &'a FsBlobStore,
        adapters: &'a AdapterRegistry,
        options: SyncOptions,
        policy: RetryPolicy,
        scope: SyncScope,
        watch: Option<Duration>,
        format: OutputFormat,
    }

    impl SyncRun<'_> {
        /// Runs the pass (or the watch loop) alongside the extraction handoff
        /// worker; the worker drains once the engine and its queue are dropped.
        async fn execute<H: HandoffHandler>(self, handler: H) -> Result<()> {
            let (queue, worker) = handoff::channel(handler, self.policy);
            let engine = SyncEngine::new(self.db, self.adapters, self.blobs, self.options)
                .with_handoff(queue);
            let scope = self.scope;
            let format = self.format;
            let watch = self.watch;

            let passes = async move {
                let Some(interval) = watch else {
                    let summary = engine.run(&scope).await?;
                    println!("{}", output::format_run_summary(format, &scope, &summary)?);
                    return Ok::<(), anyhow::Error>(());
                };
                engine
                    .watch(&scope, interval, |pass| {
                        if let Ok(summary) = pass {
                            match output::format_run_summary(format, &scope, summary) {
                                Ok(rendered) => println!("{rendered}"),
                                Err(error) => error!("failed to render run summary: {error:#}"),
                            }
                        }
                        ControlFlow::Continue(())
                    })
                    .await;
                Ok(())
            };

            let (result, report) = tokio::join!(passes, worker.run(self.db));
            if report.failed > 0 {
                eprintln!(
                    "extraction handoff: {} delivered, {} failed",
                    report.delivered, report.failed
                );
            }
            result
        }
    }

    fn handle_attachments(
        settings: &Settings,
        command: AttachmentCommands,
        format: OutputFormat,
    ) -> Result<()> {
        let db = settings.open_database()?;
        match command {
            AttachmentCommands::List { user, page, limit } => {
                let page = attachments::list_attachments(&db, &user, page, limit)?;
                println!("{}", output::format_attachment_page(format, &page)?);
            }
            AttachmentCommands::Show { id, user } => {
                let blobs = FsBlobStore::new(&settings.blob_dir)?;
                let content = attachments::fetch_attachment_blob(&db, &blobs, &id, &user)?;
                println!("{}", output::format_attachment(format, &content)?);
            }
        }
        Ok(())
    }

    fn handle_integrations(
        settings: &Settings,
        command: IntegrationCommands,
        format: OutputFormat,
    ) -> Result<()> {
        let db = settings.open_database()?;
        match command {
            IntegrationCommands::List { provider } => {
                let integrations = db.list_integrations(provider.map(map_provider))?;
                println!("{}", output::format_integrations(format, &integrations)?);
            }
            IntegrationCommands::SetStart {
                provider,
                user,
                date,
            } => {
                let provider = map_provider(provider);
                let start = watermark::normalize_timestamp(&date).ok_or_else(|| {
                    anyhow!("invalid date '{date}', expected YYYY-MM-DD or RFC 3339")
                })?;
                let integration = db
                    .get_integration_for_user(&user, provider)?
                    .ok_or_else(|| anyhow!("no {provider} integration for user '{user}'"))?;
                let metadata = db.merge_integration_metadata(
                    &integration.id,
                    &json!({ "startReading": watermark::format_timestamp(start) }),
                )?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&metadata)?),
                    OutputFormat::Table => println!(
                        "startReading for {user} ({provider}) set to {}",
                        watermark::format_timestamp(start)
                    ),
                }
            }
        }
        Ok(())
    }

    fn map_provider(provider: ProviderArg) -> Provider {
        match provider {
            ProviderArg::Gmail => Provider::Gmail,
            ProviderArg::Outlook => Provider::Outlook,
        }
    }
}
