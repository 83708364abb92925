use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vendorplan::config::Config;
use vendorplan::db::{DbPool, create_pool, init_db, queries};
use vendorplan::error::{AppError, Result};
use vendorplan::jobs::{self, JobOutcome};
use vendorplan::models::{CreateShop, CreateUser};
use vendorplan::usage;

#[derive(Parser, Debug)]
#[command(name = "vendorplan")]
#[command(about = "Subscription and quota governance for multi-tenant marketplaces")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server and the maintenance scheduler (default)
    Serve,
    /// Reset monthly order counters now, regardless of schedule
    ResetUsage,
    /// Recompute storage usage for every shop from media rows
    RecomputeStorage,
    /// Insert the default plans that do not exist yet
    SeedPlans,
    /// Print global usage statistics as JSON
    Stats,
    /// Dev helper: create a shop with a vendor user and print its API key
    CreateVendor {
        #[arg(long)]
        shop_name: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "Vendor")]
        name: String,
    },
    /// Attach billing provider ids to a plan
    LinkPlan {
        /// Plan slug, e.g. "starter"
        #[arg(long)]
        slug: String,
        #[arg(long)]
        price_id: String,
        #[arg(long)]
        product_id: Option<String>,
    },
}

fn open_database(config: &Config) -> Result<DbPool> {
    let pool = create_pool(&config.database_path)?;
    let conn = pool.get()?;
    init_db(&conn)?;
    let seeded = queries::seed_default_plans(&conn)?;
    if seeded > 0 {
        tracing::info!("Seeded {} default plans", seeded);
    }
    Ok(pool)
}

fn print_outcome(job: &str, outcome: JobOutcome) {
    match outcome {
        JobOutcome::Ran(n) => println!("{}: {} shops updated", job, n),
        JobOutcome::NotDue => println!("{}: not due", job),
        JobOutcome::LeaseHeld => println!("{}: already running elsewhere", job),
    }
}

fn run_command(command: Command, config: &Config) -> Result<()> {
    let pool = open_database(config)?;
    let now = queries::now();

    match command {
        Command::Serve => unreachable!("serve is handled by main"),
        Command::ResetUsage => {
            print_outcome(
                jobs::MONTHLY_RESET_JOB,
                jobs::run_monthly_reset(&pool, now, true)?,
            );
        }
        Command::RecomputeStorage => {
            print_outcome(
                jobs::STORAGE_RECOMPUTE_JOB,
                jobs::run_storage_recompute(&pool, now, true)?,
            );
        }
        Command::SeedPlans => {
            // open_database already seeded; report what exists.
            let conn = pool.get()?;
            for plan in queries::list_active_plans(&conn)? {
                println!("{} ({})", plan.slug, plan.id);
            }
        }
        Command::Stats => {
            let conn = pool.get()?;
            let stats = usage::global_stats(&conn)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::CreateVendor {
            shop_name,
            email,
            name,
        } => {
            if !config.dev_mode {
                return Err(AppError::Forbidden(
                    "create-vendor is only available in dev mode (set VENDORPLAN_ENV=dev)"
                        .into(),
                ));
            }
            let conn = pool.get()?;
            let shop = queries::create_shop(&conn, &CreateShop { name: shop_name })?;
            let user = queries::create_user(
                &conn,
                &CreateUser {
                    email,
                    name,
                    shop_id: Some(shop.id.clone()),
                },
            )?;
            let (_, api_key) = queries::create_api_key(&conn, &user.id)?;

            println!("Shop:    {}", shop.id);
            println!("User:    {}", user.id);
            println!("API Key: {}", api_key);
            println!("Save this API key, it will not be shown again.");
        }
        Command::LinkPlan {
            slug,
            price_id,
            product_id,
        } => {
            let conn = pool.get()?;
            let plan = queries::get_plan_by_slug(&conn, &slug)?
                .ok_or_else(|| AppError::NotFound(format!("Plan '{}' not found", slug)))?;
            queries::set_plan_external_ids(&conn, &plan.id, product_id.as_deref(), &price_id)?;
            println!("Linked plan {} to price {}", slug, price_id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vendorplan=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        command => {
            if let Err(e) = run_command(command, &config) {
                eprintln!("ERROR: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn serve(config: Config) {
    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    let pool = open_database(&config).expect("Failed to initialize database");
    let addr = config.addr();
    let state = vendorplan::build_state(config, pool).expect("Failed to build application state");

    jobs::spawn_maintenance_task(state.clone());

    let app = vendorplan::app(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("vendorplan listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
