//! Alarm dispatcher — the entry point other subsystems call to raise an alarm.
//!
//! `send_message` never fails and never waits for delivery:
//! 1. Decorate the title with the environment tag
//! 2. Run the fuse controller (classification + repeat counting)
//! 3. Resolve the target platform
//! 4. In dry-run mode, log and stop
//! 5. Otherwise enqueue on the primary queue for the worker pool

use std::sync::Arc;

use herald_common::config::{AlarmConfig, AppConfig};
use herald_common::error::AppError;
use herald_common::types::{AlarmMessage, AlarmTextMessage, SendContext};
use herald_notifier::AlarmSender;

use crate::classifier::MessageClassifier;
use crate::fuse::{FuseController, FuseDecision};
use crate::queue::DispatchQueue;
use crate::rules::RuleSource;
use crate::store::AlarmStore;
use crate::worker::{Delivery, PoolSettings, WorkerPool};

pub struct AlarmDispatcher {
    config: AlarmConfig,
    service_name: String,
    environment: String,
    fuse: FuseController,
    queue: DispatchQueue,
    pool: WorkerPool,
}

impl AlarmDispatcher {
    /// Validate the alarm settings and start the worker pool and promoter.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &AppConfig,
        store: Arc<dyn AlarmStore>,
        rules: Arc<dyn RuleSource>,
        sender: Arc<dyn AlarmSender>,
    ) -> Result<Self, AppError> {
        let alarm = &config.alarm;
        alarm.validate()?;

        let classifier = MessageClassifier::new(store.clone(), rules, alarm.rule_cache_ttl);
        let fuse = FuseController::new(
            store.clone(),
            classifier,
            alarm.cooldown_window,
            alarm.fuse_duration,
        );
        let queue = DispatchQueue::new(store, &config.service_name, alarm.dequeue_timeout);
        let delivery = Arc::new(Delivery::new(queue.clone(), sender, alarm.send_timeout));
        let pool = WorkerPool::start(
            queue.clone(),
            delivery,
            PoolSettings {
                workers: alarm.worker_count(),
                promote_interval: alarm.promote_interval,
                promote_batch: alarm.promote_batch,
            },
        );

        Ok(Self {
            config: alarm.clone(),
            service_name: config.service_name.clone(),
            environment: config.environment.clone(),
            fuse,
            queue,
            pool,
        })
    }

    /// Send an alarm to the default platform.
    pub async fn send_biz_message(&self, ctx: &SendContext, title: &str, info: &str) {
        self.send_message(ctx, "", title, info).await;
    }

    /// Raise an alarm on `platform` (empty = default platform).
    ///
    /// Returns once the alarm is suppressed, logged (dry-run) or queued.
    /// Failures are logged, never returned.
    pub async fn send_message(&self, ctx: &SendContext, platform: &str, title: &str, info: &str) {
        let operation = ctx.operation_or(title);
        let title = format!("[{}] {}", self.environment.to_uppercase(), title);

        if self.fuse.admit(&self.service_name, info).await == FuseDecision::Suppress {
            return;
        }

        let platform = self.resolve_platform(platform);
        let title = format!("[{}] {}", platform, title);

        if self.config.dry_run {
            tracing::info!(
                platform = %platform,
                title = %title,
                info = %info,
                "Dry-run alarm, not dispatched"
            );
            return;
        }

        let message = AlarmMessage::new(
            platform,
            AlarmTextMessage {
                trace_id: ctx.trace_id_or_new(),
                operation,
                title,
                info: info.to_string(),
            },
            self.config.max_retry,
        );

        if let Err(e) = self.queue.enqueue(&message).await {
            tracing::error!(
                trace_id = %message.trace_id(),
                error = %e,
                "Failed to enqueue alarm message"
            );
        }
    }

    /// Stop the worker pool and promoter. Idempotent.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn resolve_platform(&self, platform: &str) -> String {
        if platform.is_empty() {
            return self.config.default_platform.clone();
        }
        if !self.config.webhooks.contains_key(platform) {
            tracing::warn!(
                platform,
                default_platform = %self.config.default_platform,
                "Unknown alarm platform, using default"
            );
            return self.config.default_platform.clone();
        }
        platform.to_string()
    }
}
