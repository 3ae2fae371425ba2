use anyhow::{Context, Result};
use clap::Parser;
use misting_monitor::cli::{Cli, Commands, WatchArgs};
use misting_monitor::config::Config;
use misting_monitor::mqtt::{MqttBridge, MqttSettings};
use misting_monitor::poller::{DashboardView, PollerSettings, TelemetryPoller};
use misting_monitor::source::{EventLogQuery, HttpSource, TelemetrySource};
use misting_monitor::stats::DerivedStats;
use misting_monitor::telemetry::SnapshotPayload;
use misting_monitor::types::{Reading, Window};
use serde::Serialize;
use serde_json::Value as JsonValue;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,misting_monitor=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url.trim().trim_end_matches('/').to_string();
        url::Url::parse(&config.api_url).context("invalid --api-url")?;
    }
    init_tracing()?;

    let source = HttpSource::from_config(&config);
    match cli.command {
        Commands::Watch(args) => watch(&config, source, args).await,
        Commands::Status(args) => {
            let poller = TelemetryPoller::new(source, PollerSettings::from_config(&config));
            poller.fetch_snapshot().await?;
            let view = poller.view();
            if args.json {
                print_json(&view)
            } else {
                print_status(&view);
                Ok(())
            }
        }
        Commands::Stats(args) => {
            let mut settings = PollerSettings::from_config(&config);
            let window = args.window.unwrap_or(config.default_window);
            settings.initial_window = window;
            let poller = TelemetryPoller::new(source, settings);
            poller.fetch_historical(window).await?;
            let view = poller.view();
            if args.json {
                print_json(&*view.stats)
            } else {
                print_stats(&view, window);
                Ok(())
            }
        }
        Commands::Control(args) => {
            let poller = TelemetryPoller::new(source, PollerSettings::from_config(&config));
            let (_, control) = poller.send_control(args.action.into(), args.mode).await?;
            println!(
                "misting {:?} (mode {:?})",
                control.misting_status, control.mode
            );
            Ok(())
        }
        Commands::Events(args) => {
            let window = args.window.unwrap_or(config.default_window);
            let page = source
                .fetch_events(EventLogQuery {
                    time_range_hours: window.hours(),
                    page: args.page.max(1),
                    page_size: config.event_page_size,
                })
                .await?;
            if args.json {
                return print_json(&page);
            }
            println!("page {} of {} ({window})", args.page.max(1), page.total_pages);
            for event in &page.events {
                println!(
                    "{:>6}  {:<25}  {:<16}  {:>6}  {}",
                    event.id.map(|id| id.to_string()).unwrap_or_default(),
                    event.timestamp.map(|ts| ts.to_rfc3339()).unwrap_or_default(),
                    event.trigger_type.as_deref().unwrap_or("-"),
                    event.duration.map(|d| format!("{d:.0}s")).unwrap_or_default(),
                    event.reason.as_deref().unwrap_or(""),
                );
            }
            Ok(())
        }
        Commands::Summary(args) => {
            let window = args.window.unwrap_or(config.default_window);
            let summary = source.fetch_summary(window.hours()).await?;
            if args.json {
                return print_json(&summary);
            }
            println!(
                "{} activations in the last {}h",
                summary.total_activations, summary.time_range_hours
            );
            for (trigger, count) in &summary.activations_by_trigger {
                println!("  {trigger:<20} {count}");
            }
            Ok(())
        }
        Commands::Export(args) => {
            let window = args.window.unwrap_or(config.default_window);
            let body = source.export_data(window).await?;
            match args.output {
                Some(path) => {
                    std::fs::write(&path, &body)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), bytes = body.len(), "export written");
                }
                None => {
                    use std::io::Write;
                    std::io::stdout()
                        .write_all(&body)
                        .context("failed to write export to stdout")?;
                }
            }
            Ok(())
        }
    }
}

async fn watch(config: &Config, source: HttpSource, args: WatchArgs) -> Result<()> {
    let mut settings = PollerSettings::from_config(config);
    if let Some(window) = args.window {
        settings.initial_window = window;
    }
    let poller = TelemetryPoller::new(source, settings);
    let mut views = poller.subscribe();
    poller.start_polling();

    let bridge = if args.mqtt || config.enable_mqtt {
        let bridge = MqttBridge::new(MqttSettings::from_config(config));
        for topic in [bridge.settings().sensor_topic(), bridge.settings().status_topic()] {
            let poller = poller.clone();
            let label = topic.clone();
            bridge.subscribe(topic, move |value: &JsonValue| {
                match serde_json::from_value::<SnapshotPayload>(value.clone()) {
                    Ok(payload) => {
                        poller.apply_pushed_snapshot(payload);
                    }
                    Err(err) => {
                        tracing::debug!(topic = %label, error = %err, "ignoring mqtt payload");
                    }
                }
            });
        }
        bridge.connect();
        Some(bridge)
    } else {
        None
    };

    let stale_after = config.stale_after();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                if args.json {
                    print_json(&*view)?;
                } else {
                    tracing::info!(
                        window = %view.window,
                        temperature = ?view.snapshot.average.temperature,
                        humidity = ?view.snapshot.average.humidity,
                        misting = ?view.control.misting_status,
                        mode = ?view.control.mode,
                        stale = view.is_stale(chrono::Utc::now(), stale_after),
                        failures = view.freshness.consecutive_failures,
                        "dashboard updated"
                    );
                }
            }
        }
    }

    poller.stop_polling_and_wait().await;
    if let Some(bridge) = bridge {
        bridge.disconnect().await;
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fmt_value(value: Option<f64>, unit: &str) -> String {
    value
        .map(|v| format!("{v:.1}{unit}"))
        .unwrap_or_else(|| "--".to_string())
}

fn print_reading(label: &str, reading: &Reading) {
    println!(
        "{label:<8} {:>8}  {:>7}",
        fmt_value(reading.temperature, "°C"),
        fmt_value(reading.humidity, "%"),
    );
}

fn print_status(view: &DashboardView) {
    let snapshot = &view.snapshot;
    print_reading("sensor1", &snapshot.sensor1);
    print_reading("sensor2", &snapshot.sensor2);
    print_reading("average", &snapshot.average);
    println!(
        "misting  {:?} (mode {:?})",
        view.control.misting_status, view.control.mode
    );
    println!("water    {}", fmt_value(snapshot.water_level, "%"));
    println!(
        "person   {}{}",
        if snapshot.human_detected { "detected" } else { "none" },
        snapshot
            .person_detection_status
            .as_deref()
            .map(|status| format!(" ({status})"))
            .unwrap_or_default()
    );
}

fn print_stats(view: &DashboardView, window: Window) {
    println!(
        "window {window}, last reading {}",
        view.last_updated()
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    for (sensor_id, stats) in view.stats.iter() {
        println!(
            "{sensor_id}: {} samples, {} misting readings",
            stats.samples, stats.misting_cycles
        );
        print_derived("  temperature", &stats.temperature, "°C");
        print_derived("  humidity", &stats.humidity, "%");
    }
}

fn print_derived(label: &str, stats: &DerivedStats, unit: &str) {
    println!(
        "{label:<14} avg {}  min {}  max {}  median {}  sd {}",
        fmt_value(stats.avg, unit),
        fmt_value(stats.min, unit),
        fmt_value(stats.max, unit),
        fmt_value(stats.median, unit),
        fmt_value(stats.std_dev, unit),
    );
}
