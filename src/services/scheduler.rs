// src/services/scheduler.rs
//! Background maintenance: the hourly usage snapshot and the daily
//! reset/expiry sweep.
//!
//! Both loops wake on wall-clock boundaries recomputed each iteration, so a
//! slow run only delays itself. Job bodies take `now` explicitly and can be
//! driven directly.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Timelike};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{Database, ResetDay};
use crate::error::Result;
use crate::models::STATUS_INACTIVE;
use crate::services::flow_policy::FlowPolicy;

const STATISTICS_RETENTION_HOURS: i64 = 48;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DailyReport {
    pub reset_users: u64,
    pub reset_user_tunnels: u64,
    pub disabled_users: usize,
    pub disabled_user_tunnels: usize,
}

pub struct MaintenanceJobs {
    db: Database,
    policy: Arc<FlowPolicy>,
}

impl MaintenanceJobs {
    pub fn new(db: Database, policy: Arc<FlowPolicy>) -> Self {
        Self { db, policy }
    }

    /// Records one statistics row per user for the hour containing `now`, then
    /// drops rows older than the retention window. Returns the rows written.
    pub async fn run_statistics_job(&self, now: DateTime<Local>) -> Result<usize> {
        let hour_mark = top_of_hour(now);
        let created_time = hour_mark.timestamp_millis();
        let label = hour_mark.format("%H:00").to_string();

        let mut written = 0;
        for user in self.db.list_users().await? {
            let total = user.in_flow + user.out_flow;
            let previous = match self.db.latest_statistics_total(user.id).await {
                Ok(previous) => previous.unwrap_or(0),
                Err(e) => {
                    warn!(user_id = user.id, "Skipping usage snapshot: {}", e);
                    continue;
                }
            };
            // Counters were reset since the last snapshot.
            let delta = match total - previous {
                d if d < 0 => total,
                d => d,
            };

            match self
                .db
                .insert_statistics(user.id, delta, total, &label, created_time)
                .await
            {
                Ok(()) => written += 1,
                Err(e) => warn!(user_id = user.id, "Failed to write usage snapshot: {}", e),
            }
        }

        let cutoff = now.timestamp_millis() - STATISTICS_RETENTION_HOURS * 3_600_000;
        let pruned = self.db.prune_statistics(cutoff).await?;
        info!(written, pruned, hour = %label, "Usage snapshot recorded");
        Ok(written)
    }

    /// Resets monthly counters due today, then disables expired users and
    /// grants after pausing their forwards.
    pub async fn run_reset_and_expiry_job(&self, now: DateTime<Local>) -> Result<DailyReport> {
        let today = now.date_naive();
        let last_day = days_in_month(today);
        let reset = ResetDay {
            day: today.day(),
            last_day_of_month: (today.day() == last_day).then_some(last_day),
        };

        let mut report = DailyReport {
            reset_users: self.db.reset_user_flows(reset).await?,
            reset_user_tunnels: self.db.reset_user_tunnel_flows(reset).await?,
            ..Default::default()
        };

        let now_ms = now.timestamp_millis();
        for user in self.db.list_expired_users(now_ms).await? {
            match self.db.list_active_forwards_by_user(user.id).await {
                Ok(forwards) => self.policy.pause_all(&forwards).await,
                Err(e) => warn!(user_id = user.id, "Failed to list forwards: {}", e),
            }
            match self.db.set_user_status(user.id, STATUS_INACTIVE).await {
                Ok(()) => report.disabled_users += 1,
                Err(e) => warn!(user_id = user.id, "Failed to disable user: {}", e),
            }
        }

        for grant in self.db.list_expired_user_tunnels(now_ms).await? {
            match self
                .db
                .list_active_forwards_by_user_tunnel(grant.user_id, grant.tunnel_id)
                .await
            {
                Ok(forwards) => self.policy.pause_all(&forwards).await,
                Err(e) => warn!(user_tunnel_id = grant.id, "Failed to list forwards: {}", e),
            }
            match self.db.set_user_tunnel_status(grant.id, STATUS_INACTIVE).await {
                Ok(()) => report.disabled_user_tunnels += 1,
                Err(e) => warn!(user_tunnel_id = grant.id, "Failed to disable grant: {}", e),
            }
        }

        info!(
            reset_users = report.reset_users,
            reset_user_tunnels = report.reset_user_tunnels,
            disabled_users = report.disabled_users,
            disabled_user_tunnels = report.disabled_user_tunnels,
            "Daily maintenance finished"
        );
        Ok(report)
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the background loops. Created once by the service root.
pub struct MaintenanceScheduler {
    jobs: Arc<MaintenanceJobs>,
    running: Mutex<Option<Running>>,
}

impl MaintenanceScheduler {
    pub fn new(jobs: Arc<MaintenanceJobs>) -> Self {
        Self {
            jobs,
            running: Mutex::new(None),
        }
    }

    pub fn jobs(&self) -> &Arc<MaintenanceJobs> {
        &self.jobs
    }

    /// Spawns both loops. A second call while running does nothing.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Maintenance scheduler already running");
            return;
        }

        let cancel = CancellationToken::new();
        let hourly = {
            let jobs = self.jobs.clone();
            spawn_loop("hourly statistics", cancel.clone(), next_hour, move || {
                let jobs = jobs.clone();
                async move {
                    if let Err(e) = jobs.run_statistics_job(Local::now()).await {
                        error!("Hourly statistics job failed: {}", e);
                    }
                }
            })
        };
        let daily = {
            let jobs = self.jobs.clone();
            spawn_loop("daily maintenance", cancel.clone(), next_daily_run, move || {
                let jobs = jobs.clone();
                async move {
                    if let Err(e) = jobs.run_reset_and_expiry_job(Local::now()).await {
                        error!("Daily maintenance job failed: {}", e);
                    }
                }
            })
        };

        *running = Some(Running {
            cancel,
            handles: vec![hourly, daily],
        });
        info!("Maintenance scheduler started");
    }

    /// Cancels both loops and waits until they have exited.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                error!("Maintenance loop panicked: {}", e);
            }
        }
        info!("Maintenance scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    next_run: fn(DateTime<Local>) -> DateTime<Local>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let wait = (next_run(now) - now)
                .to_std()
                .unwrap_or(Duration::from_secs(1));
            debug!(job = name, wait_secs = wait.as_secs(), "Next maintenance run scheduled");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            job().await;
        }
        debug!(job = name, "Maintenance loop exited");
    })
}

fn top_of_hour(now: DateTime<Local>) -> DateTime<Local> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn next_hour(now: DateTime<Local>) -> DateTime<Local> {
    top_of_hour(now) + ChronoDuration::hours(1)
}

/// Next 00:00:05 local time.
fn next_daily_run(now: DateTime<Local>) -> DateTime<Local> {
    let today = now.date_naive();
    let candidate = |date: NaiveDate| {
        date.and_hms_opt(0, 0, 5)
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
    };
    match candidate(today) {
        Some(run) if run > now => run,
        _ => today
            .succ_opt()
            .and_then(candidate)
            .unwrap_or(now + ChronoDuration::days(1)),
    }
}

fn days_in_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewForward, NewNode, NewTunnel, UserTunnelGrant};
    use crate::models::STATUS_ACTIVE;
    use crate::services::dispatcher::{Dispatcher, RecordingTransport};
    use crate::services::orchestrator::Orchestrator;

    async fn setup() -> (Database, Arc<RecordingTransport>, MaintenanceJobs) {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), transport.clone()));
        let orchestrator = Arc::new(Orchestrator::new(db.clone(), dispatcher));
        let policy = Arc::new(FlowPolicy::new(db.clone(), orchestrator));
        (db.clone(), transport, MaintenanceJobs::new(db, policy))
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).earliest().unwrap()
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2026, 4, 10).unwrap()), 30);
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2026, 12, 31).unwrap()), 31);
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2028, 2, 1).unwrap()), 29);
    }

    #[test]
    fn test_next_runs_follow_wall_clock() {
        let now = at(2026, 3, 10, 14, 37);
        assert_eq!(next_hour(now), at(2026, 3, 10, 15, 0));

        let daily = next_daily_run(now);
        assert_eq!(daily.date_naive(), NaiveDate::from_ymd_opt(2026, 3, 11).unwrap());
        assert_eq!((daily.hour(), daily.minute(), daily.second()), (0, 0, 5));

        let just_after_midnight = at(2026, 3, 10, 0, 0);
        assert_eq!(next_daily_run(just_after_midnight).date_naive(), just_after_midnight.date_naive());
    }

    #[tokio::test]
    async fn test_statistics_delta_and_retention() {
        let (db, _, jobs) = setup().await;
        let now = at(2026, 3, 10, 14, 37);
        let user = db.create_user("bob", 1, 10, 0, 0).await.unwrap();
        db.add_user_flow(user.id, 100, 200).await.unwrap();

        let hour_ago = top_of_hour(now).timestamp_millis() - 3_600_000;
        let stale = now.timestamp_millis() - 49 * 3_600_000;
        db.insert_statistics(user.id, 10, 100, "13:00", stale).await.unwrap();
        db.insert_statistics(user.id, 50, 250, "13:00", hour_ago).await.unwrap();

        jobs.run_statistics_job(now).await.unwrap();

        let rows = db.list_statistics(user.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        let latest = rows.last().unwrap();
        assert_eq!(latest.flow, 50);
        assert_eq!(latest.total_flow, 300);
        assert_eq!(latest.time, "14:00");
        assert_eq!(latest.created_time, top_of_hour(now).timestamp_millis());
    }

    #[tokio::test]
    async fn test_statistics_after_counter_reset_uses_current_total() {
        let (db, _, jobs) = setup().await;
        let now = at(2026, 3, 10, 14, 0);
        let user = db.create_user("carol", 1, 10, 0, 0).await.unwrap();
        db.add_user_flow(user.id, 40, 0).await.unwrap();
        db.insert_statistics(user.id, 0, 500, "13:00", now.timestamp_millis() - 3_600_000)
            .await
            .unwrap();

        jobs.run_statistics_job(now).await.unwrap();

        let latest = db.list_statistics(user.id).await.unwrap().pop().unwrap();
        assert_eq!(latest.flow, 40);
        assert_eq!(latest.total_flow, 40);
    }

    #[tokio::test]
    async fn test_daily_job_resets_and_disables() {
        let (db, transport, jobs) = setup().await;
        let now = at(2026, 4, 30, 0, 0);
        let now_ms = now.timestamp_millis();

        let node = db
            .create_node(&NewNode {
                name: "edge".to_string(),
                secret: "s".to_string(),
                server_ip: "10.0.0.1".to_string(),
                api_port: 8088,
                port_range: "30000-30010".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let (tunnel, _) = db
            .insert_tunnel_with_hops(
                &NewTunnel {
                    name: "t".to_string(),
                    tunnel_type: 1,
                    traffic_ratio: 1.0,
                    flow_factor: 1.0,
                    flow_quota: 0,
                    protocol: "tls".to_string(),
                },
                &[],
            )
            .await
            .unwrap();

        // Reset day 31 falls on the last day of a 30-day month.
        let expired = db.create_user("expired", 1, 10, now_ms - 1000, 31).await.unwrap();
        let later = db.create_user("later", 1, 10, 0, 15).await.unwrap();
        db.add_user_flow(expired.id, 10, 10).await.unwrap();
        db.add_user_flow(later.id, 10, 10).await.unwrap();

        let grant = db
            .upsert_user_tunnel(&UserTunnelGrant {
                user_id: expired.id,
                tunnel_id: tunnel.id,
                flow: 10,
                exp_time: now_ms - 1000,
                flow_reset_time: 30,
                ..Default::default()
            })
            .await
            .unwrap();
        db.add_user_tunnel_flow(grant.id, 5, 5).await.unwrap();

        let (forward, _) = db
            .insert_forward_with_ports(
                &NewForward {
                    user_id: expired.id,
                    user_name: "expired".to_string(),
                    name: "web".to_string(),
                    tunnel_id: tunnel.id,
                    remote_addr: "192.0.2.1:80".to_string(),
                    strategy: "fifo".to_string(),
                },
                &[(node.id, 30000)],
            )
            .await
            .unwrap();
        transport.fail_node(node.id).await;

        let report = jobs.run_reset_and_expiry_job(now).await.unwrap();
        assert_eq!(report.disabled_users, 1);
        assert_eq!(report.disabled_user_tunnels, 1);

        let expired = db.get_user(expired.id).await.unwrap();
        assert_eq!(expired.status, STATUS_INACTIVE);
        assert_eq!(expired.in_flow + expired.out_flow, 0);

        let later = db.get_user(later.id).await.unwrap();
        assert_eq!(later.status, STATUS_ACTIVE);
        assert_eq!(later.in_flow + later.out_flow, 20);

        let grant = db.get_user_tunnel(grant.id).await.unwrap();
        assert_eq!(grant.status, STATUS_INACTIVE);
        assert_eq!(grant.in_flow + grant.out_flow, 0);

        assert_eq!(db.get_forward(forward.id).await.unwrap().status, STATUS_INACTIVE);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_waits() {
        let (_, _, jobs) = setup().await;
        let scheduler = MaintenanceScheduler::new(Arc::new(jobs));

        scheduler.start().await;
        scheduler.start().await;
        assert!(scheduler.is_running().await);

        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
        scheduler.stop().await;
    }
}
