use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::error::Result;
use crate::state::AppContext;

pub const COLLECT_EVERY: Duration = Duration::from_secs(30);
pub const DETECT_EVERY: Duration = Duration::from_secs(120);
pub const INBOUND_SYNC_EVERY: Duration = Duration::from_secs(300);
pub const LIMITS_EVERY: Duration = Duration::from_secs(3600);
pub const HEALTH_EVERY: Duration = Duration::from_secs(60);
pub const BALANCE_EVERY: Duration = Duration::from_secs(600);
const RETRAIN_HOUR: u32 = 3;

/// Next Sunday 03:00 strictly after `now`, in `now`'s time zone.
pub fn next_weekly_run<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let days_ahead = (7 - now.weekday().num_days_from_sunday()) % 7;
    let at = NaiveTime::from_hms_opt(RETRAIN_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
    let mut date = now.date_naive() + ChronoDuration::days(i64::from(days_ahead));

    loop {
        // A DST gap can swallow 03:00; the hour after always exists.
        let candidate = date
            .and_time(at)
            .and_local_timezone(now.timezone())
            .earliest()
            .or_else(|| {
                (date.and_time(at) + ChronoDuration::hours(1))
                    .and_local_timezone(now.timezone())
                    .earliest()
            });
        match candidate {
            Some(run) if run > *now => return run,
            _ => date += ChronoDuration::days(7),
        }
    }
}

/// Runs `task` every `period` until the process exits. A failing tick is
/// logged and the loop carries on.
fn every<F>(name: &'static str, period: Duration, task: F) -> JoinHandle<()>
where
    F: Fn() -> BoxFuture<'static, Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = task().await {
                error!("❌ Job '{}' failed: {}", name, e);
            }
        }
    })
}

fn weekly_retrain(ctx: AppContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let next = next_weekly_run(&now);
            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));
            info!("🧠 Next model retraining at {}", next.format("%Y-%m-%d %H:%M %Z"));
            tokio::time::sleep(wait).await;

            if let Err(e) = ctx.detector.train_model().await {
                error!("❌ Job 'retrain' failed: {}", e);
            }
        }
    })
}

/// Starts every periodic job. The handles are returned so the caller can
/// abort them on shutdown.
pub fn spawn_all(ctx: &AppContext) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let c = ctx.clone();
    handles.push(every("traffic-collect", COLLECT_EVERY, move || {
        let c = c.clone();
        Box::pin(async move { c.collector.collect().await.map(|_| ()) })
    }));

    let c = ctx.clone();
    handles.push(every("anomaly-detect", DETECT_EVERY, move || {
        let c = c.clone();
        Box::pin(async move {
            c.detector.detect_anomalies().await;
            Ok(())
        })
    }));

    let c = ctx.clone();
    handles.push(every("inbound-traffic-sync", INBOUND_SYNC_EVERY, move || {
        let c = c.clone();
        Box::pin(async move { c.inbounds.sync_traffic().await.map(|_| ()) })
    }));

    let c = ctx.clone();
    handles.push(every("client-limits", LIMITS_EVERY, move || {
        let c = c.clone();
        Box::pin(async move { c.clients.enforce_limits().await.map(|_| ()) })
    }));

    let c = ctx.clone();
    handles.push(every("server-health", HEALTH_EVERY, move || {
        let c = c.clone();
        Box::pin(async move { c.servers.health_check_all().await.map(|_| ()) })
    }));

    let c = ctx.clone();
    handles.push(every("auto-balance", BALANCE_EVERY, move || {
        let c = c.clone();
        Box::pin(async move { c.servers.auto_balance().await.map(|_| ()) })
    }));

    handles.push(weekly_retrain(ctx.clone()));

    info!("⏱️ {} background jobs started", handles.len());
    handles
}
