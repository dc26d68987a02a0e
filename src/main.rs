use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use futures::future::join_all;
use metrics_exporter_prometheus::PrometheusBuilder;

use otc_signal_engine::{
    config::settings::Settings,
    routes::{health::health_scope, status::status_scope},
    services::{
        clock::{Clock, SystemClock},
        dispatcher::{Notifier, SignalDispatcher},
        eligibility::{EligibilityGate, HttpPayoutSource, PayoutCache, PayoutSource, StaticPayoutSource},
        engine::EngineDeps,
        market_data::{HttpFeed, MarketFeed, SyntheticFeed},
        notifiers::{LogNotifier, TelegramNotifier, WebhookNotifier},
        scheduler::{shutdown_channel, Scheduler, StatusRegistry},
    },
};

fn init_logging() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
        .init();
}

fn build_notifier(settings: &Settings) -> Arc<dyn Notifier> {
    if let (Some(token), Some(chat)) = (&settings.telegram_token, &settings.telegram_chat_id) {
        return Arc::new(TelegramNotifier::new(token, chat));
    }
    if let Some(url) = &settings.webhook_url {
        return Arc::new(WebhookNotifier::new(url, settings.webhook_secret.clone()));
    }
    log::warn!("no Telegram or webhook sink configured; signals go to the log only");
    Arc::new(LogNotifier)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    println!("Starting OTC signal engine…");

    let settings = Settings::new().unwrap_or_else(|e| {
        eprintln!("Failed to load settings: {e}");
        std::process::exit(1);
    });
    let port = settings.server_port;
    let cfg = Arc::new(settings.engine.clone());

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(h) => Some(h),
        Err(e) => {
            log::warn!("prometheus recorder not installed: {e}");
            None
        }
    };

    // --- collaborators -----------------------------------------------------
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let el = &cfg.eligibility;

    let feed: Arc<dyn MarketFeed> = match (&settings.feed_url, settings.is_demo()) {
        (Some(url), false) => Arc::new(HttpFeed::new(url)),
        _ => Arc::new(SyntheticFeed::new(Arc::clone(&clock), cfg.candle_capacity)),
    };
    let payouts: Arc<dyn PayoutSource> = match (&settings.payout_url, settings.is_demo()) {
        (Some(url), false) => Arc::new(HttpPayoutSource::new(url, el.fallback_payout_rate)),
        _ => Arc::new(StaticPayoutSource::new(el.fallback_payout_rate)),
    };
    let cache = Arc::new(PayoutCache::new(payouts, Arc::clone(&clock), el.payout_ttl, el.payout_expiry));
    let notifier = build_notifier(&settings);

    let deps = EngineDeps {
        feed,
        eligibility: EligibilityGate::new(cache, el),
        dispatcher: SignalDispatcher::new(Arc::clone(&notifier)),
        clock,
    };

    log::info!(
        "mode={} instruments={:?} timeframes={}/{}/{} sink={}",
        settings.app_mode,
        cfg.instruments,
        cfg.timeframes.htf,
        cfg.timeframes.mtf,
        cfg.timeframes.ltf,
        notifier.name()
    );
    if let Err(e) = notifier
        .notify_text(&format!("🚀 Signal engine started: {}", cfg.instruments.join(", ")))
        .await
    {
        log::warn!("startup notice failed: {e}");
    }

    // --- workers -----------------------------------------------------------
    let registry = StatusRegistry::new();
    let (trigger, shutdown) = shutdown_channel();
    let workers = Scheduler::new(Arc::clone(&cfg), deps, registry.clone()).spawn_all(shutdown);

    // --- http --------------------------------------------------------------
    let server = HttpServer::new(move || {
        let mut app = App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(registry.clone()));
        if let Some(h) = &prometheus {
            app = app.app_data(web::Data::new(h.clone()));
        }
        app.service(status_scope())
            .service(health_scope())
    })
        .disable_signals()
        .bind(("0.0.0.0", port))
        .with_context(|| format!("binding port {port}"))?
        .run();
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    log::info!("ctrl-c received, stopping workers");
    trigger.fire();
    join_all(workers).await;
    server_handle.stop(true).await;
    if let Ok(Err(e)) = server_task.await {
        log::error!("http server: {e}");
    }

    if let Err(e) = notifier.notify_text("🛑 Signal engine stopped").await {
        log::warn!("shutdown notice failed: {e}");
    }
    Ok(())
}
