use chrono::Duration;
use clap::{Parser, Subcommand};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use vip_entitlement::admin::VipManager;
use vip_entitlement::config::TrackerConfig;
use vip_entitlement::entitlement::EntitlementState;
use vip_entitlement::logging::init_logging;
use vip_entitlement::realtime::spawn_change_feed;
use vip_entitlement::store::{InMemorySubscriptionStore, RestSubscriptionStore, SubscriptionStore};
use vip_entitlement::tracker::{Clock, EntitlementTracker, SystemClock, TrackerHandle};
use vip_entitlement::version::VERSION;

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "vip-tracker", author, version = VERSION, about = "Tracks and administers time-limited VIP access", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Admin id recorded in the audit log for write commands
    #[arg(long, global = true)]
    admin: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow a user's entitlement live until it ends or Ctrl-C
    Watch {
        #[arg(short, long)]
        user: String,
    },
    /// Check a user's entitlement once
    Status {
        #[arg(short, long)]
        user: String,
    },
    /// Grant VIP starting now
    Grant {
        #[arg(short, long)]
        user: String,
        /// Length of the grant, 30 minutes when omitted
        #[arg(short, long)]
        minutes: Option<i64>,
    },
    /// Add 30 minutes to a subscription
    Extend {
        #[arg(long)]
        id: String,
    },
    /// Expire a subscription immediately
    Cancel {
        #[arg(long)]
        id: String,
    },
    /// List all subscriptions with their remaining time
    List,
    /// Message one user, or everyone when --user is omitted
    Message {
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long)]
        text: String,
    },
    /// Grant and watch a short VIP period against an in-process store
    Demo {
        #[arg(short, long, default_value_t = 3)]
        minutes: i64,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let config = match (TrackerConfig::load(args.config.as_deref()), &args.command) {
        (Ok(config), _) => config,
        (Err(e), Command::Demo { .. }) => {
            eprintln!("No store configured ({e}); running demo with defaults.");
            TrackerConfig {
                realtime_enabled: false,
                ..TrackerConfig::default()
            }
        }
        (Err(e), _) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&config.log_dir);
    info!(version = VERSION, "vip-tracker starting.");

    let admin_id = args.admin.as_deref();
    match args.command {
        Command::Demo { minutes } => run_demo(&config, minutes).await,
        Command::Watch { user } => run_watch(&config, &user).await,
        Command::Status { user } => run_status(&config, &user).await,
        Command::Grant { user, minutes } => {
            let record = manager(&config)?
                .grant_vip(admin_id, &user, minutes.map(minutes_to_duration).transpose()?)
                .await?;
            println!("Granted {} to {} until {}", record.id, record.user_id, record.end_time);
            Ok(())
        }
        Command::Extend { id } => {
            let record = manager(&config)?.extend_vip(admin_id, &id).await?;
            println!("Extended {} until {}", record.id, record.end_time);
            Ok(())
        }
        Command::Cancel { id } => {
            let record = manager(&config)?.cancel_vip(admin_id, &id).await?;
            println!("Cancelled {} for {}", record.id, record.user_id);
            Ok(())
        }
        Command::List => run_list(&config).await,
        Command::Message { user, text } => {
            let stored = manager(&config)?
                .send_message(admin_id, user.as_deref(), &text)
                .await?;
            println!("Sent message {}", stored.id);
            Ok(())
        }
    }
}

fn minutes_to_duration(minutes: i64) -> Result<Duration, BoxError> {
    Duration::try_minutes(minutes).ok_or_else(|| format!("{minutes} minutes is out of range").into())
}

fn rest_store(config: &TrackerConfig) -> Result<Arc<dyn SubscriptionStore>, BoxError> {
    Ok(Arc::new(RestSubscriptionStore::new(config)?))
}

fn manager(config: &TrackerConfig) -> Result<VipManager, BoxError> {
    Ok(VipManager::new(rest_store(config)?, Arc::new(SystemClock)))
}

async fn run_status(config: &TrackerConfig, user_id: &str) -> Result<(), BoxError> {
    let store = rest_store(config)?;
    let tracker = EntitlementTracker::from_config(store.clone(), config);
    let entitlement = tracker.try_refresh(user_id).await?;
    let state = EntitlementState::resolve(entitlement, tracker.clock().now());

    match (state.countdown(), state.tier()) {
        (Some(countdown), Some(tier)) => println!("VIP active: {countdown} left ({tier})"),
        _ => println!("No active VIP subscription."),
    }

    match store.unread_messages(user_id).await {
        Ok(messages) => {
            for message in messages {
                println!("[{}] {}", message.created_at, message.message);
            }
        }
        Err(e) => warn!(user_id = %user_id, error = %e, "Could not load admin messages."),
    }
    Ok(())
}

async fn run_list(config: &TrackerConfig) -> Result<(), BoxError> {
    let manager = manager(config)?;
    let stats = manager.dashboard_stats().await?;
    println!("Active VIPs: {}", stats.active_vips);
    for row in manager.list().await? {
        let state = if row.is_active { "active" } else { "inactive" };
        println!(
            "{}  user={}  {}  ends={}  left={}",
            row.record.id,
            row.record.user_id,
            state,
            row.record.end_time,
            row.remaining_display()
        );
    }
    Ok(())
}

async fn run_watch(config: &TrackerConfig, user_id: &str) -> Result<(), BoxError> {
    let store = rest_store(config)?;
    let tracker = EntitlementTracker::from_config(store, config);

    let (notifications, feed_task) = if config.realtime_enabled {
        let (rx, task) = spawn_change_feed(config.clone(), user_id);
        (Some(rx), Some(task))
    } else {
        info!("Realtime disabled; relying on polling.");
        (None, None)
    };

    let handle = tracker.spawn(user_id, notifications);
    watch_until_locked(handle, user_id).await;

    if let Some(task) = feed_task {
        task.abort();
    }
    Ok(())
}

async fn run_demo(config: &TrackerConfig, minutes: i64) -> Result<(), BoxError> {
    let store = Arc::new(InMemorySubscriptionStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let manager = VipManager::new(store.clone(), clock.clone());
    let tracker = EntitlementTracker::new(store.clone(), clock, config.into());

    let user_id = "demo-user";
    let handle = tracker.spawn(user_id, Some(store.change_feed()));
    let record = manager
        .grant_vip(Some("demo-admin"), user_id, Some(minutes_to_duration(minutes)?))
        .await?;
    info!(subscription_id = %record.id, minutes, "Demo grant created.");

    watch_until_locked(handle, user_id).await;
    Ok(())
}

/// Logs the countdown whenever it changes. Returns after an active period
/// ends or on Ctrl-C.
async fn watch_until_locked(handle: TrackerHandle, user_id: &str) {
    let mut states: watch::Receiver<EntitlementState> = handle.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut was_unlocked = false;
    let mut last_countdown: Option<String> = None;
    let mut reported_locked = false;

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    warn!(user_id = %user_id, "Tracker stopped unexpectedly.");
                    break;
                }
                let state = states.borrow_and_update().clone();
                match (state.countdown(), state.tier()) {
                    (Some(countdown), Some(tier)) => {
                        if last_countdown.as_deref() != Some(countdown.as_str()) {
                            info!(user_id = %user_id, remaining = %countdown, tier = %tier, "VIP countdown.");
                            last_countdown = Some(countdown);
                        }
                        was_unlocked = true;
                        reported_locked = false;
                    }
                    _ if was_unlocked => {
                        info!(user_id = %user_id, "VIP period ended.");
                        break;
                    }
                    _ => {
                        if !reported_locked {
                            info!(user_id = %user_id, "No active VIP subscription; waiting for one.");
                            reported_locked = true;
                        }
                    }
                }
            }
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for Ctrl-C.");
                }
                info!("Shutting down.");
                break;
            }
        }
    }

    handle.shutdown().await;
}
