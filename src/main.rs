use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use yakua::application::{UserAgent, UserAgentConfig};
use yakua::config::Config;
use yakua::domain::registration::{RegistrationState, RegistrationStatus};
use yakua::domain::shared::SipAddress;
use yakua::domain::subscription::{PresenceSubscription, SubscriptionEventKind};
use yakua::infrastructure::metrics::describe_metrics;
use yakua::infrastructure::protocols::sip::{
    AccountMessageFactory, DigestChallengeHandler, SipStack, SipStackConfig, SipTimers,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let print_config = args.iter().any(|a| a == "--print-config");
    let path = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .map(String::as_str)
        .unwrap_or("yakua.toml");

    // Load configuration
    let config = Config::load(Some(path))?;
    if print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("Starting YakUA signaling core");
    describe_metrics();

    let address = config.account_address().map_err(|e| anyhow::anyhow!(e))?;
    let server_addr = config
        .registrar_addr()
        .map_err(|e| anyhow::anyhow!(e))?
        .ok_or_else(|| anyhow::anyhow!("account.registrar must be configured"))?;

    // Start the SIP stack
    let stack = SipStack::bind(SipStackConfig {
        bind_addr: config.bind_addr().map_err(|e| anyhow::anyhow!(e))?,
        server_addr,
        timers: SipTimers::default(),
    })
    .await?;
    info!("SIP stack bound to {}", stack.local_addr());

    let messages = Arc::new(
        AccountMessageFactory::new(
            address.clone(),
            stack.local_addr().to_string(),
            config.sip.user_agent.clone(),
        )
        .with_outbound_proxy(config.account.outbound_proxy.clone()),
    );
    let challenges = Arc::new(DigestChallengeHandler::new(config.credentials(), stack.clone()));
    let status = Arc::new(RegistrationStatus::new());

    let user_agent = Arc::new(UserAgent::new(
        UserAgentConfig {
            address,
            subscription: config.subscription_config(),
            packages: config.event_packages(),
            watchdog: config.watchdog_config(),
        },
        stack.clone(),
        messages,
        challenges,
        status.clone(),
    ));

    stack.start(user_agent.clone())?;
    user_agent.start();

    // REGISTER is handled outside this core; treat the account as registered
    status.set_state(RegistrationState::Registering, None);
    status.set_state(RegistrationState::Registered, Some("static registration".to_string()));

    // Presence subscriptions from the configuration
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    for target in &config.account.presence_targets {
        let target = match SipAddress::parse(target) {
            Ok(target) => target,
            Err(e) => {
                warn!("Skipping presence target {}: {}", target, e);
                continue;
            }
        };
        let subscription = Arc::new(PresenceSubscription::new(target.clone(), None, events_tx.clone()));
        if let Err(e) = user_agent.subscribe(subscription).await {
            warn!("Cannot subscribe to presence of {}: {}", target, e);
        }
    }
    drop(events_tx);

    let event_logger = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event.kind {
                SubscriptionEventKind::Active { body } => info!(
                    "{} of {}: {} bytes",
                    event.package,
                    event.address,
                    body.len()
                ),
                SubscriptionEventKind::MessageSummary(summary) => info!(
                    "{} new messages for {}",
                    summary.total_new(),
                    event.address
                ),
                kind => info!("{} subscription to {}: {:?}", event.package, event.address, kind),
            }
        }
    });

    // Keep running until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    user_agent.shutdown().await;
    stack.shutdown().await;
    event_logger.abort();

    Ok(())
}
