use std::path::PathBuf;

use a3s_lending::services::library::UserType;
use a3s_lending::{
    event_types, Broker, BrokerPump, Event, HandlerError, LendingSystem, LibraryError,
    SystemConfig,
};
use chrono::{Duration, Utc};
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "a3s-lending",
    about = "Run the event-driven library lending walkthrough"
)]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override broker.max_retries from the config
    #[arg(long)]
    max_retries: Option<u32>,

    /// Subscribe an always-failing billing handler to BookReturned
    #[arg(long)]
    inject_failure: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match SystemConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("[a3s-lending] {e}");
                std::process::exit(1);
            }
        },
        None => SystemConfig::default(),
    };
    if let Some(max_retries) = cli.max_retries {
        config.broker.max_retries = max_retries;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .without_time()
        .init();

    if let Err(e) = run(&cli, &config).await {
        eprintln!("[a3s-lending] {e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, config: &SystemConfig) -> Result<(), LibraryError> {
    let system = LendingSystem::new(config)?;
    if cli.inject_failure {
        system
            .broker()
            .register(event_types::BOOK_RETURNED, "billing", |_: &Event, _: &Broker| {
                Err(HandlerError::failed("billing backend unavailable"))
            })?;
    }

    let pump = BrokerPump::spawn(system.broker().clone(), config.broker.pump_interval());

    let library = system.library();
    let ada = library.register_user("ada@example.com", "Ada Lovelace", UserType::Premium)?;
    let alan = library.register_user("alan@example.com", "Alan Turing", UserType::Standard)?;
    let dune = library.add_book("978-0441172719", "Dune", "Frank Herbert", 2)?;
    let sicp = library.add_book("978-0262510875", "SICP", "Abelson & Sussman", 1)?;

    let a_month_ago = Utc::now() - Duration::days(30);
    library.borrow_book_at(&ada.id, &dune.id, a_month_ago)?;
    library.borrow_book(&alan.id, &sicp.id)?;
    if let Err(e) = library.borrow_book(&ada.id, &sicp.id) {
        println!("rejected: {e}");
    }
    let late = library.return_book(&ada.id, &dune.id)?;
    println!(
        "{} returned \"{}\" with a late fee of {} cents",
        ada.name, dune.title, late.late_fee
    );
    library.suspend_user(&alan.id, "overdue items")?;

    let report = pump.shutdown().await?;
    println!(
        "delivered={} retried={} dead_lettered={}",
        report.delivered, report.retried, report.dead_lettered
    );

    for user in [&ada, &alan] {
        for notification in system.notifications().user_notifications(&user.id)? {
            println!("[{}] {}: {}", notification.notification_type, user.name, notification.message);
        }
    }

    let metrics = system.analytics().metrics()?;
    println!("metrics: {}", serde_json::to_string(&metrics).map_err(a3s_lending::EventError::from)?);

    let dead_letters = system.broker().failed_events()?;
    if !dead_letters.is_empty() {
        println!(
            "dead letters:\n{}",
            serde_json::to_string_pretty(&dead_letters).map_err(a3s_lending::EventError::from)?
        );
    }
    Ok(())
}
